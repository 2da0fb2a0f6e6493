//! Shader reflection input.
//!
//! The runtime does not compile or reflect shaders. A reflection collaborator
//! hands over the canonical per-binding metadata below, which is used purely
//! as cache-key material and to check bind-time compatibility.

use std::fmt;

use serde::Serialize;

use crate::error::{CinderError, Result};
use crate::flags::ShaderStage;

/// Kind of resource a descriptor binding references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u32)]
pub enum DescriptorType {
    Sampler = 0,
    CombinedImageSampler = 1,
    SampledImage = 2,
    StorageImage = 3,
    UniformTexelBuffer = 4,
    StorageTexelBuffer = 5,
    UniformBuffer = 6,
    StorageBuffer = 7,
}

impl DescriptorType {
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Array size of a binding, either a literal or an index into the stage's
/// specialization constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorCount {
    pub value: u32,
    pub is_spec_constant: bool,
}

impl DescriptorCount {
    #[must_use]
    pub const fn fixed(value: u32) -> Self {
        Self {
            value,
            is_spec_constant: false,
        }
    }

    #[must_use]
    pub const fn spec_constant(index: u32) -> Self {
        Self {
            value: index,
            is_spec_constant: true,
        }
    }

    /// Resolves the count against a stage's specialization constants.
    pub fn resolve(self, spec_constants: &[u32]) -> Result<u32> {
        if !self.is_spec_constant {
            return Ok(self.value);
        }
        spec_constants
            .get(self.value as usize)
            .copied()
            .ok_or_else(|| {
                CinderError::validation(format!(
                    "descriptor count refers to spec constant {} but only {} were given",
                    self.value,
                    spec_constants.len()
                ))
            })
    }
}

/// One reflected binding slot of a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub descriptor_type: DescriptorType,
    pub count: DescriptorCount,
}

/// A push-constant block. `size == 0` means the shader has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

/// Reflected resource interface of a single shader entry point.
///
/// `descriptor_set_layouts[set][binding]`; a binding with a zero count is
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderLayout {
    pub push_constants: PushConstantRange,
    pub descriptor_set_layouts: Vec<Vec<ShaderBinding>>,
}

impl ShaderLayout {
    pub fn validate(&self) -> Result<()> {
        let pc = self.push_constants;
        if pc.size > 0 && (pc.offset % 4 != 0 || pc.size % 4 != 0) {
            return Err(CinderError::validation(format!(
                "push constant range [offset {}, size {}] is not 4-byte aligned",
                pc.offset, pc.size
            )));
        }
        Ok(())
    }
}

/// One stage's contribution to a pipeline layout.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLayoutCreateInfo<'a> {
    pub shader_layout: &'a ShaderLayout,
    pub stage: ShaderStage,
    pub spec_constants: &'a [u32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_constant_count_resolves() {
        let count = DescriptorCount::spec_constant(1);
        assert_eq!(count.resolve(&[3, 16]).unwrap(), 16);
        assert!(count.resolve(&[3]).is_err());
        assert_eq!(DescriptorCount::fixed(4).resolve(&[]).unwrap(), 4);
    }

    #[test]
    fn unaligned_push_constants_fail_validation() {
        let layout = ShaderLayout {
            push_constants: PushConstantRange { offset: 0, size: 6 },
            ..Default::default()
        };
        assert!(layout.validate().is_err());
    }
}
