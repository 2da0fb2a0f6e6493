//! # Cinder Sync
//!
//! CPU/GPU synchronization primitives: [`TimelineSemaphore`] with its
//! [`TimelinePromise`] and [`TimelineWaiter`] tickets, and the
//! [`DestroyerQueue`] mailbox that carries deferred destruction from any
//! thread to the next frame boundary.

pub mod destroyer;
pub mod timeline;

pub use cinder_core::SemaphoreSubmit;
pub use destroyer::{BoxedDestroyer, Destroyer, DestroyerQueue, DestroyerSender, run_destroyers};
pub use timeline::{TimelinePromise, TimelineSemaphore, TimelineSignal, TimelineWaiter};
