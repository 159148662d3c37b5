//! Bounded multi-producer, multi-consumer queues connecting pipeline stages.
//!
//! Producers hold clones of a `SyncSender`; a full queue blocks them. The
//! queue closes once every sender is dropped, after which consumers drain
//! what is left and then see `None`. If every consumer is gone, `send`
//! fails, which upstream stages take as a signal to stop.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};

/// Capacity of every inter-stage queue.
pub const QUEUE_CAPACITY: usize = 100;

/// Receiving half shared by a pool of workers.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<Receiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedReceiver<T> {
    /// Block until an item arrives, or return `None` once the queue is
    /// closed and empty.
    pub fn recv(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.recv())
    }
}

pub fn bounded<T>(capacity: usize) -> (SyncSender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (
        tx,
        SharedReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_workers_share_items() {
        let (tx, rx) = bounded::<u32>(4);
        let (out_tx, out_rx) = bounded::<u32>(4);

        let total: u32 = thread::scope(|s| {
            for _ in 0..3 {
                let rx = rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    for n in rx.iter() {
                        out_tx.send(n * 2).unwrap();
                    }
                });
            }
            drop(rx);
            drop(out_tx);

            s.spawn(move || {
                for n in 1..=50 {
                    tx.send(n).unwrap();
                }
            });

            out_rx.iter().sum()
        });

        assert_eq!(total, (1..=50).map(|n| n * 2).sum::<u32>());
    }

    #[test]
    fn test_send_fails_without_consumers() {
        let (tx, rx) = bounded::<u32>(1);
        drop(rx);
        assert!(tx.send(1).is_err());
    }
}
