//! Descriptor-set and pipeline layout caches.
//!
//! A pipeline layout is derived by merging the reflected [`ShaderLayout`] of
//! every stage that takes part in a pipeline:
//!
//! - Push constants must be empty or identical (offset and size) in every
//!   stage that declares them; the stage flags are OR-ed together.
//! - Per `(set, binding)` the stage flags are OR-ed; descriptor type and
//!   count must agree between stages. Counts can come from a specialization
//!   constant of the stage. Zero-count bindings are absent.
//!
//! Every set layout and the pipeline layout itself go through an
//! [`ObjectCache`], so identical reflection data always maps to one backend
//! object.

use std::sync::Arc;

use cinder_core::{
    BackendContext, CacheKey, CacheKeyBuilder, CinderError, CreateRequest, DescriptorSetLayoutHandle,
    DescriptorType, LayoutBinding, PipelineLayoutCreateInfo, PipelineLayoutHandle, PoolSize,
    PushConstantBlock, Result, ShaderStage, SharedBackend,
};
use serde::Serialize;
use smallvec::SmallVec;

use crate::object_cache::{CacheSnapshot, ObjectCache};

// ─── Layout Objects ──────────────────────────────────────────────────────────

/// A cached descriptor-set layout. `bindings[i]` is `None` for an empty slot.
#[derive(Debug)]
pub struct DescriptorSetLayout {
    key: CacheKey,
    name: String,
    handle: DescriptorSetLayoutHandle,
    bindings: Vec<Option<LayoutBinding>>,
}

impl DescriptorSetLayout {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> DescriptorSetLayoutHandle {
        self.handle
    }

    #[must_use]
    pub fn bindings(&self) -> &[Option<LayoutBinding>] {
        &self.bindings
    }

    #[must_use]
    pub fn binding(&self, index: u32) -> Option<&LayoutBinding> {
        self.bindings.get(index as usize).and_then(Option::as_ref)
    }

    /// Descriptors one pool bank of `bank_size` sets must reserve.
    ///
    /// Fails when a binding's count times `bank_size` does not fit a `u32`.
    pub fn pool_sizes(&self, bank_size: u32) -> Result<SmallVec<[PoolSize; 8]>> {
        self.bindings
            .iter()
            .flatten()
            .map(|b| {
                let count = b.count.checked_mul(bank_size).ok_or_else(|| {
                    CinderError::validation(format!(
                        "descriptor count {} of {} binding in layout {} overflows a pool bank of {bank_size} sets",
                        b.count, b.descriptor_type, self.name
                    ))
                })?;
                Ok(PoolSize {
                    descriptor_type: b.descriptor_type,
                    count,
                })
            })
            .collect()
    }
}

/// A cached pipeline layout with the set layouts it was built from.
#[derive(Debug)]
pub struct PipelineLayout {
    key: CacheKey,
    name: String,
    handle: PipelineLayoutHandle,
    push_constants: Option<PushConstantBlock>,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> PipelineLayoutHandle {
        self.handle
    }

    #[must_use]
    pub fn push_constants(&self) -> Option<PushConstantBlock> {
        self.push_constants
    }

    #[must_use]
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    #[must_use]
    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }

    /// Checks a push-constant write against the merged range.
    pub fn validate_push_constants(&self, offset: u32, size: u32) -> Result<()> {
        let range = self.push_constants.map_or((0, 0), |p| (p.offset, p.size));
        let end = u64::from(offset) + u64::from(size);
        if offset < range.0 || end > u64::from(range.0) + u64::from(range.1) {
            return Err(CinderError::validation(format!(
                "push constants [offset {offset}, size {size}] exceed layout {} range [offset {}, size {}]",
                self.name, range.0, range.1
            )));
        }
        Ok(())
    }

    /// Checks that `sets` can be bound starting at `first_set`: the range
    /// must exist in this layout and every set must use the layout's set
    /// layout at its index.
    pub fn validate_bind(&self, first_set: u32, sets: &[&DescriptorSetLayout]) -> Result<()> {
        let end = first_set as usize + sets.len();
        if end > self.set_layouts.len() {
            return Err(CinderError::validation(format!(
                "binding sets [{first_set}, {end}) but layout {} only has {} sets",
                self.name,
                self.set_layouts.len()
            )));
        }
        for (i, set) in sets.iter().enumerate() {
            let expected = &self.set_layouts[first_set as usize + i];
            if expected.key != set.key {
                return Err(CinderError::validation(format!(
                    "set {} has layout {} but pipeline layout {} expects {}",
                    first_set as usize + i,
                    set.name,
                    self.name,
                    expected.name
                )));
            }
        }
        Ok(())
    }
}

// ─── Merge ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MergedBinding {
    stages: ShaderStage,
    descriptor_type: DescriptorType,
    count: u32,
}

#[derive(Debug, Default)]
struct MergedLayout {
    push_constants: Option<PushConstantBlock>,
    sets: Vec<Vec<Option<MergedBinding>>>,
}

fn merge(infos: &[PipelineLayoutCreateInfo<'_>]) -> Result<MergedLayout> {
    let mut merged = MergedLayout::default();

    for (i, info) in infos.iter().enumerate() {
        let layout = info.shader_layout;
        layout.validate().map_err(|err| {
            CinderError::validation(format!("shader layout [{i}] ({}) is invalid: {err}", info.stage))
        })?;

        let pc = layout.push_constants;
        if pc.size > 0 {
            if let Some(block) = merged.push_constants.as_mut() {
                if block.offset != pc.offset || block.size != pc.size {
                    return Err(CinderError::validation(format!(
                        "push constants must be empty or consistent between all stages: \
                         [{}, {}, {}] and [{}, {}, {}]",
                        block.stages, block.offset, block.size, info.stage, pc.offset, pc.size
                    )));
                }
                block.stages |= info.stage;
            } else {
                merged.push_constants = Some(PushConstantBlock {
                    stages: info.stage,
                    offset: pc.offset,
                    size: pc.size,
                });
            }
        }

        if merged.sets.len() < layout.descriptor_set_layouts.len() {
            merged.sets.resize_with(layout.descriptor_set_layouts.len(), Vec::new);
        }
        for (set, bindings) in layout.descriptor_set_layouts.iter().enumerate() {
            let slots = &mut merged.sets[set];
            if slots.len() < bindings.len() {
                slots.resize(bindings.len(), None);
            }
            for (binding, reflected) in bindings.iter().enumerate() {
                let count = reflected.count.resolve(info.spec_constants).map_err(|err| {
                    CinderError::validation(format!("set[{set}] binding[{binding}]: {err}"))
                })?;
                if count == 0 {
                    continue;
                }
                let current = slots[binding];
                let next = MergedBinding {
                    stages: current.map_or(info.stage, |c| c.stages | info.stage),
                    descriptor_type: reflected.descriptor_type,
                    count,
                };
                if let Some(current) = current {
                    if (current.descriptor_type, current.count) != (next.descriptor_type, next.count) {
                        return Err(CinderError::validation(format!(
                            "set[{set}] binding[{binding}] has inconsistent metadata: \
                             {}[{}] in {} and {}[{}] in {}",
                            current.descriptor_type,
                            current.count,
                            current.stages,
                            next.descriptor_type,
                            next.count,
                            info.stage
                        )));
                    }
                }
                slots[binding] = Some(next);
            }
        }
    }
    Ok(merged)
}

/// Renders the identity key and the readable name of one set layout.
fn set_layout_key(bindings: &[Option<MergedBinding>]) -> (CacheKey, String) {
    if bindings.is_empty() {
        return (CacheKey::new("[null]"), "[null]".to_owned());
    }
    let mut key = CacheKeyBuilder::new();
    let mut name = CacheKeyBuilder::new();
    for slot in bindings {
        match slot {
            None => {
                key = key.field_str("null");
                name = name.field_str("null");
            }
            Some(b) => {
                key = key.field_str(&format!(
                    "0x{:X}:0x{:X}:{}",
                    b.stages.bits(),
                    b.descriptor_type.raw(),
                    b.count
                ));
                name = name.field_str(&format!("{}:{}:{}", b.stages, b.descriptor_type, b.count));
            }
        }
    }
    (key.build(), name.into_string())
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Serializable view of both layout caches.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutSnapshot {
    pub descriptor_set_layouts: CacheSnapshot,
    pub pipeline_layouts: CacheSnapshot,
}

pub struct LayoutCache {
    backend: SharedBackend,
    set_layouts: ObjectCache<DescriptorSetLayoutHandle>,
    pipeline_layouts: ObjectCache<PipelineLayoutHandle>,
}

impl LayoutCache {
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            set_layouts: ObjectCache::new("descriptor_set_layouts", backend.clone()),
            pipeline_layouts: ObjectCache::new("pipeline_layouts", backend.clone()),
            backend,
        }
    }

    /// Merges per-stage reflection into a cached pipeline layout.
    ///
    /// Inconsistent reflection data is returned as a validation error;
    /// backend creation failures are fatal.
    pub fn create_pipeline_layout(
        &self,
        infos: &[PipelineLayoutCreateInfo<'_>],
    ) -> Result<Arc<PipelineLayout>> {
        let merged = merge(infos)?;

        let mut key = match merged.push_constants {
            Some(p) => CacheKeyBuilder::new()
                .field_hex(u64::from(p.stages.bits()))
                .field_u32(p.offset)
                .field_u32(p.size)
                .into_string(),
            None => "[0x0,0,0]".to_owned(),
        };
        let mut name = match merged.push_constants {
            Some(p) => format!("[{},{},{}]", p.stages, p.offset, p.size),
            None => "[None,0,0]".to_owned(),
        };

        let mut set_layouts = Vec::with_capacity(merged.sets.len());
        for bindings in &merged.sets {
            let layout = self.set_layout(bindings);
            key.push_str(layout.key.as_str());
            name.push_str(&layout.name);
            set_layouts.push(layout);
        }

        let key = CacheKey::new(key);
        let handles: SmallVec<[DescriptorSetLayoutHandle; 4]> =
            set_layouts.iter().map(|l| l.handle).collect();
        let handle = self.pipeline_layouts.lookup_or_create(&key, || {
            let h = self
                .backend
                .create_handle(&CreateRequest::PipelineLayout {
                    name: &name,
                    set_layouts: &handles,
                    push_constants: merged.push_constants,
                })
                .context(|| format!("creating pipeline layout {name}"))?;
            Ok(PipelineLayoutHandle::from_handle(h))
        });

        Ok(Arc::new(PipelineLayout {
            key,
            name,
            handle,
            push_constants: merged.push_constants,
            set_layouts,
        }))
    }

    fn set_layout(&self, merged: &[Option<MergedBinding>]) -> Arc<DescriptorSetLayout> {
        let (key, name) = set_layout_key(merged);
        let bindings: Vec<Option<LayoutBinding>> = merged
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.map(|b| LayoutBinding {
                    binding: i as u32,
                    descriptor_type: b.descriptor_type,
                    count: b.count,
                    stages: b.stages,
                })
            })
            .collect();
        let present: SmallVec<[LayoutBinding; 8]> = bindings.iter().flatten().copied().collect();

        let handle = self.set_layouts.lookup_or_create(&key, || {
            let h = self
                .backend
                .create_handle(&CreateRequest::DescriptorSetLayout {
                    name: &name,
                    bindings: &present,
                })
                .context(|| format!("creating descriptor set layout {name}"))?;
            Ok(DescriptorSetLayoutHandle::from_handle(h))
        });

        Arc::new(DescriptorSetLayout {
            key,
            name,
            handle,
            bindings,
        })
    }

    #[must_use]
    pub fn set_layouts(&self) -> &ObjectCache<DescriptorSetLayoutHandle> {
        &self.set_layouts
    }

    #[must_use]
    pub fn pipeline_layouts(&self) -> &ObjectCache<PipelineLayoutHandle> {
        &self.pipeline_layouts
    }

    #[must_use]
    pub fn snapshot(&self) -> LayoutSnapshot {
        LayoutSnapshot {
            descriptor_set_layouts: self.set_layouts.snapshot(),
            pipeline_layouts: self.pipeline_layouts.snapshot(),
        }
    }
}
