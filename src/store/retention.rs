//! Periodic deletion of expired messages.

use crate::error::Result;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use super::MessageStore;

/// Runs `delete_older_than(retention)` every `interval` until stopped.
pub struct RetentionJob {
    stop: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionJob {
    pub fn start(store: Arc<dyn MessageStore>, interval: Duration, retention: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("courier-retention".into())
            .spawn(move || loop {
                match store.delete_older_than(retention) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, ?retention, "deleted expired messages"),
                    Err(e) => error!(error = %e, "retention sweep failed"),
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => {
                        debug!("retention job stopped");
                        return;
                    }
                }
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn stop(&self) {
        // Disconnecting wakes the sleeping thread
        self.stop.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("retention thread panicked");
            }
        }
    }
}

impl Drop for RetentionJob {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{StoredMessage, Timestamp};
    use std::time::Instant;

    #[test]
    fn test_sweeps_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let job = RetentionJob::start(
            store.clone(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        )
        .unwrap();

        store
            .insert(&StoredMessage::new("t", b"1".to_vec(), Timestamp::now()))
            .unwrap();
        assert_eq!(store.len(), 1);

        std::thread::sleep(Duration::from_millis(200));
        assert!(store.is_empty());
        job.stop();
    }

    #[test]
    fn test_stop_is_prompt() {
        let store = Arc::new(MemoryStore::new());
        let job = RetentionJob::start(store, Duration::from_secs(60), Duration::from_secs(60)).unwrap();

        let started = Instant::now();
        job.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
