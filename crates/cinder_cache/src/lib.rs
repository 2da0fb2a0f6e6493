//! # Cinder Cache
//!
//! Deterministic get-or-create caches for backend objects:
//!
//! - [`ObjectCache`]: the race-safe keyed cache every other cache builds on
//! - [`LayoutCache`]: descriptor-set and pipeline layouts derived from
//!   shader reflection
//! - [`DescriptorSetCache`]: banked descriptor pools with free-list reuse
//! - [`PipelineCache`]: pipeline libraries and linked pipelines, with
//!   background optimized relinking

pub mod descriptor_pool;
pub mod layout;
pub mod object_cache;
pub mod pipeline_cache;

pub use descriptor_pool::{BankSnapshot, DescriptorSet, DescriptorSetCache, DescriptorSetCacheSnapshot};
pub use layout::{DescriptorSetLayout, LayoutCache, LayoutSnapshot, PipelineLayout};
pub use object_cache::{CacheSnapshot, CacheStats, ObjectCache, Outcome};
pub use pipeline_cache::{Pipeline, PipelineCache, PipelineDesc};
