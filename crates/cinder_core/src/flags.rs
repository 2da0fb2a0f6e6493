//! Bit flags shared between the runtime and the backend.
//!
//! Bit values follow the Vulkan encoding so that a Vulkan backend can pass
//! them through untouched.

use std::fmt;

use bitflags::bitflags;
use serde::{Serialize, Serializer};

bitflags! {
    /// Shader stages a binding or push-constant range is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct ShaderStage: u32 {
        const VERTEX = 0x0000_0001;
        const TESSELLATION_CONTROL = 0x0000_0002;
        const TESSELLATION_EVALUATION = 0x0000_0004;
        const GEOMETRY = 0x0000_0008;
        const FRAGMENT = 0x0000_0010;
        const COMPUTE = 0x0000_0020;
    }
}

bitflags! {
    /// Pipeline stages used in semaphore wait/signal submissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStage: u64 {
        // DRAW_INDIRECT is not exclusive to draw calls
        const INDIRECT = 0x0000_0002;
        const VERTEX_INPUT = 0x0000_0004;
        const VERTEX_SHADER = 0x0000_0008;
        const FRAGMENT_SHADER = 0x0000_0080;
        const FRAGMENT_TESTS = 0x0000_0100 | 0x0000_0200;
        // colour attachment output also covers depth resolve
        const RENDER_ATTACHMENT_WRITE = 0x0000_0400 | 0x0000_0200;
        const COMPUTE = 0x0000_0800;
        const TRANSFER = 0x0000_1000;
        const GRAPHICS = 0x0000_8000;
        const ALL = 0x0001_0000;
    }
}

bitflags! {
    /// Usage of a frame scratch buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM_TEXEL = 0x0000_0004;
        const STORAGE_TEXEL = 0x0000_0008;
        const UNIFORM = 0x0000_0010;
        const STORAGE = 0x0000_0020;
        const INDEX = 0x0000_0040;
        const VERTEX = 0x0000_0080;
        const INDIRECT = 0x0000_0100;
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(stage_label(name))?;
        }
        Ok(())
    }
}

fn stage_label(name: &str) -> &str {
    match name {
        "VERTEX" => "Vertex",
        "TESSELLATION_CONTROL" => "TessellationControl",
        "TESSELLATION_EVALUATION" => "TessellationEvaluation",
        "GEOMETRY" => "Geometry",
        "FRAGMENT" => "Fragment",
        "COMPUTE" => "Compute",
        other => other,
    }
}

impl Serialize for ShaderStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
