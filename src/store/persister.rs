//! Background writer feeding published messages to a store.

use crate::error::Result;
use crate::types::StoredMessage;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use super::MessageStore;

/// Writes messages to a store off the publish path.
///
/// `submit` never blocks. When the queue is full the message is dropped
/// and logged; store errors are logged and never surface to publishers.
///
/// Publishers only take the shared side of the sender lock, so concurrent
/// publishes do not serialize on persistence.
pub struct Persister {
    sender: RwLock<Option<Sender<StoredMessage>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn start(store: Arc<dyn MessageStore>, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<StoredMessage>(queue_capacity);

        let thread = thread::Builder::new()
            .name("courier-persist".into())
            .spawn(move || {
                for message in receiver.iter() {
                    if let Err(e) = store.insert(&message) {
                        error!(topic = %message.topic, error = %e, "persisting message failed");
                    }
                }
                debug!("persister drained");
            })?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a message for writing. Returns false if it was dropped.
    pub fn submit(&self, message: StoredMessage) -> bool {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            warn!(topic = %message.topic, "persister stopped, message not stored");
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "persist queue full, message not stored");
                false
            }
            Err(TrySendError::Disconnected(message)) => {
                warn!(topic = %message.topic, "persister gone, message not stored");
                false
            }
        }
    }

    /// Write out everything queued, then stop the thread.
    pub fn shutdown(&self) {
        // Dropping the only sender ends the worker loop once drained
        self.sender.write().take();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("persister thread panicked");
            }
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.shutdown();
    }
}
