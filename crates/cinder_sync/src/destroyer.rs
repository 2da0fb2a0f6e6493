//! Deferred destruction.
//!
//! A [`Destroyer`] is a one-shot release action for something the GPU may
//! still be reading. Destroyers are parked in a frame slot and run only after
//! that slot's completion waiter resolved.
//!
//! Work that finishes off the rendering thread (a background pipeline relink,
//! for instance) cannot touch the frame ring. It posts its destroyers into the
//! [`DestroyerQueue`] mailbox through a cloned [`DestroyerSender`] instead, and
//! the next frame submission drains the mailbox into its own slot.

use flume::{Receiver, Sender, TrySendError};

/// Releases a resource once the GPU is done with it.
pub trait Destroyer: Send + 'static {
    fn destroy(self: Box<Self>);
}

impl<F> Destroyer for F
where
    F: FnOnce() + Send + 'static,
{
    #[inline]
    fn destroy(self: Box<Self>) {
        (*self)();
    }
}

pub type BoxedDestroyer = Box<dyn Destroyer>;

/// Runs every destroyer in order.
pub fn run_destroyers(destroyers: impl IntoIterator<Item = BoxedDestroyer>) -> usize {
    let mut n = 0;
    for d in destroyers {
        d.destroy();
        n += 1;
    }
    n
}

/// Multi-producer, single-consumer mailbox of pending destroyers.
pub struct DestroyerQueue {
    tx: Sender<BoxedDestroyer>,
    rx: Receiver<BoxedDestroyer>,
}

impl Default for DestroyerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DestroyerQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// A producer endpoint usable from any thread.
    #[must_use]
    pub fn sender(&self) -> DestroyerSender {
        DestroyerSender(self.tx.clone())
    }

    /// Takes everything currently queued without blocking.
    pub fn drain(&self) -> Vec<BoxedDestroyer> {
        self.rx.try_iter().collect()
    }

    /// Moves everything currently queued to the end of `into`.
    pub fn drain_into(&self, into: &mut Vec<BoxedDestroyer>) -> usize {
        let before = into.len();
        into.extend(self.rx.try_iter());
        into.len() - before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Cloneable producer side of a [`DestroyerQueue`].
#[derive(Clone)]
pub struct DestroyerSender(Sender<BoxedDestroyer>);

impl DestroyerSender {
    pub fn send(&self, destroyer: impl Destroyer) {
        self.send_boxed(Box::new(destroyer));
    }

    /// Never blocks. Once the mailbox is gone the device has been idled for
    /// teardown, so the destroyer runs on the spot.
    pub fn send_boxed(&self, destroyer: BoxedDestroyer) {
        match self.0.try_send(destroyer) {
            Ok(()) => {}
            Err(TrySendError::Disconnected(d) | TrySendError::Full(d)) => {
                log::debug!("Destroyer mailbox closed, destroying immediately");
                d.destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn drain_is_non_blocking_and_ordered() {
        let queue = DestroyerQueue::new();
        assert!(queue.drain().is_empty());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            queue.sender().send(move || order.lock().unwrap().push(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(run_destroyers(queue.drain()), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn closed_mailbox_destroys_immediately() {
        let queue = DestroyerQueue::new();
        let sender = queue.sender();
        drop(queue);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        sender.send(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
