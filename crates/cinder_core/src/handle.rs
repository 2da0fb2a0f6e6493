//! Strongly-typed backend object handles.
//!
//! Every object the GPU backend creates is identified by an opaque [`Handle`]:
//! a kind tag plus a non-zero raw value chosen by the backend. The runtime never
//! dereferences handles; it only stores, compares and hands them back.
//!
//! Thin `Copy` newtypes ([`PipelineHandle`], [`DescriptorSetHandle`], …) wrap a
//! [`Handle`] of a fixed kind so that a pipeline can never be passed where a
//! descriptor pool is expected.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Serialize, Serializer};

/// The category of a backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum HandleKind {
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorPool,
    DescriptorSet,
    Pipeline,
    Semaphore,
    Frame,
    ScratchBuffer,
    CommandBuffer,
    SurfaceImage,
}

/// Untyped backend object handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    kind: HandleKind,
    raw: NonZeroU64,
}

impl Handle {
    #[inline]
    #[must_use]
    pub const fn new(kind: HandleKind, raw: NonZeroU64) -> Self {
        Self { kind, raw }
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> HandleKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({self})", self.kind)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.raw)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident => $kind:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
            #[serde(transparent)]
            pub struct $name(Handle);

            impl $name {
                /// Wraps an untyped handle.
                ///
                /// **Panics** if `handle` is of another kind; the backend
                /// returned an object that was not requested.
                #[inline]
                #[must_use]
                pub fn from_handle(handle: Handle) -> Self {
                    assert_eq!(
                        handle.kind(),
                        HandleKind::$kind,
                        "backend returned {handle:?} where a {} was requested",
                        stringify!($kind),
                    );
                    Self(handle)
                }

                #[inline]
                #[must_use]
                pub const fn handle(self) -> Handle {
                    self.0
                }
            }

            impl From<$name> for Handle {
                #[inline]
                fn from(h: $name) -> Self {
                    h.0
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }
        )*
    };
}

define_handles! {
    /// Handle to a backend descriptor-set layout.
    DescriptorSetLayoutHandle => DescriptorSetLayout;
    /// Handle to a backend pipeline layout.
    PipelineLayoutHandle => PipelineLayout;
    /// Handle to one descriptor pool (one bank).
    DescriptorPoolHandle => DescriptorPool;
    /// Handle to a descriptor set allocated from a pool bank.
    DescriptorSetHandle => DescriptorSet;
    /// Handle to a shader, compute or linked executable pipeline.
    PipelineHandle => Pipeline;
    /// Handle to a timeline semaphore.
    SemaphoreHandle => Semaphore;
    /// Handle to the backend state of one frame-in-flight slot.
    FrameHandle => Frame;
    /// Handle to a host-visible buffer scoped to one frame.
    ScratchBufferHandle => ScratchBuffer;
    /// Handle to a single-use command buffer scoped to one frame.
    CommandBufferHandle => CommandBuffer;
    /// Handle to an acquired presentation image.
    SurfaceImageHandle => SurfaceImage;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: HandleKind, v: u64) -> Handle {
        Handle::new(kind, NonZeroU64::new(v).unwrap())
    }

    #[test]
    fn handles_format_as_hex() {
        let h = PipelineHandle::from_handle(raw(HandleKind::Pipeline, 0xBEEF));
        assert_eq!(h.to_string(), "0xBEEF");
        assert_eq!(format!("{h:?}"), "PipelineHandle(0xBEEF)");
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"0xBEEF\"");
    }

    #[test]
    #[should_panic(expected = "where a Pipeline was requested")]
    fn typed_handle_rejects_wrong_kind() {
        let _ = PipelineHandle::from_handle(raw(HandleKind::DescriptorPool, 1));
    }
}
