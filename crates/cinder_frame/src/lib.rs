//! # Cinder Frame
//!
//! The frame-in-flight ring. [`FrameRing::begin_frame`] hands out a
//! [`Frame`] guard for the next slot once that slot's previous submission is
//! known to be complete; ending the frame moves every destroyer queued during
//! the frame (and every destroyer posted to the ring's mailbox from other
//! threads) into the slot, to be run the next time the ring comes around.

pub mod frame;
pub mod ring;

pub use frame::{Frame, ScratchBuffer};
pub use ring::FrameRing;
