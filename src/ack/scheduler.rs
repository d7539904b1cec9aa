//! Timer thread driving acknowledgment timeouts.

use crate::error::Result;
use crate::types::MessageId;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error};

/// A deadline for one pending message.
///
/// `generation` identifies which arming of the entry this is. Re-arming an
/// entry bumps its generation, which turns every older timer into a no-op.
#[derive(Clone, Debug)]
pub(crate) struct Timer {
    pub id: MessageId,
    pub generation: u64,
    pub deadline: Instant,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
            .then_with(|| self.id.as_str().cmp(other.id.as_str()))
    }
}

enum Command {
    Arm(Timer),
    Shutdown,
}

/// Single thread firing timers in deadline order.
///
/// The fire callback may hand back a follow-up timer, which is scheduled
/// without a round trip through the command channel.
pub(crate) struct RetryScheduler {
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub(crate) fn start<F>(on_fire: F) -> Result<Self>
    where
        F: FnMut(Timer) -> Option<Timer> + Send + 'static,
    {
        let (commands, receiver) = unbounded();

        let thread = thread::Builder::new()
            .name("courier-retry".into())
            .spawn(move || run(receiver, on_fire))?;

        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn arm(&self, timer: Timer) {
        if self.commands.send(Command::Arm(timer)).is_err() {
            debug!("retry scheduler stopped, timer dropped");
        }
    }

    /// Stop the thread. Timers not yet due are discarded.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("retry scheduler thread panicked");
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(commands: crossbeam_channel::Receiver<Command>, mut on_fire: F)
where
    F: FnMut(Timer) -> Option<Timer>,
{
    let mut heap: BinaryHeap<Reverse<Timer>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
            if let Some(Reverse(timer)) = heap.pop() {
                if let Some(next) = on_fire(timer) {
                    heap.push(Reverse(next));
                }
            }
        }

        let command = match heap.peek() {
            Some(Reverse(next)) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };

        match command {
            Command::Arm(timer) => heap.push(Reverse(timer)),
            Command::Shutdown => return,
        }
    }
}
