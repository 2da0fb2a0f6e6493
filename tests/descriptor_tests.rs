//! Descriptor pool bank tests
//!
//! Tests for:
//! - Bank growth once every bank is exhausted
//! - Free-list reuse before fresh allocation
//! - Frame-deferred release of descriptor sets
//! - One pool per distinct set layout

use std::sync::Arc;

use cinder::cinder_cache::{DescriptorSetCache, LayoutCache};
use cinder::cinder_core::{
    DescriptorCount, DescriptorType, HandleKind, PipelineLayoutCreateInfo, ShaderBinding,
    ShaderLayout, ShaderStage,
};
use cinder::{DescriptorSetLayout, FrameRing};
use cinder_dev_utils::{MockBackend, init_test_logger};

// ============================================================================
// Helpers
// ============================================================================

fn set_layout(layouts: &LayoutCache, descriptor_type: DescriptorType) -> Arc<DescriptorSetLayout> {
    let shader = ShaderLayout {
        descriptor_set_layouts: vec![vec![ShaderBinding {
            descriptor_type,
            count: DescriptorCount::fixed(1),
        }]],
        ..Default::default()
    };
    let layout = layouts
        .create_pipeline_layout(&[PipelineLayoutCreateInfo {
            shader_layout: &shader,
            stage: ShaderStage::FRAGMENT,
            spec_constants: &[],
        }])
        .unwrap();
    layout.set_layouts()[0].clone()
}

fn setup(bank_size: u32) -> (Arc<MockBackend>, Arc<DescriptorSetCache>, Arc<DescriptorSetLayout>) {
    init_test_logger();
    let backend = Arc::new(MockBackend::new());
    let layouts = LayoutCache::new(backend.clone());
    let layout = set_layout(&layouts, DescriptorType::UniformBuffer);
    let cache = DescriptorSetCache::new(backend.clone(), bank_size);
    (backend, cache, layout)
}

// ============================================================================
// Bank Growth
// ============================================================================

#[test]
fn fifth_set_opens_a_second_bank() {
    let (backend, cache, layout) = setup(4);
    let sets: Vec<_> = (0..5).map(|_| cache.allocate(&layout).unwrap()).collect();

    assert_eq!(cache.bank_count(&layout), 2);
    assert_eq!(cache.bank_usage(&layout), vec![(4, 4, 0), (1, 4, 0)]);
    assert_eq!(backend.created(HandleKind::DescriptorPool), 2);
    assert_eq!(sets[3].bank_index(), 0);
    assert_eq!(sets[4].bank_index(), 1);
}

#[test]
fn released_set_is_reused_before_growing() {
    let (backend, cache, layout) = setup(4);
    let mut sets: Vec<_> = (0..5).map(|_| cache.allocate(&layout).unwrap()).collect();

    let released = sets.remove(1);
    let handle = released.handle();
    released.release();
    assert_eq!(cache.bank_usage(&layout), vec![(4, 4, 1), (1, 4, 0)]);

    let again = cache.allocate(&layout).unwrap();
    assert_eq!(again.handle(), handle);
    assert_eq!(again.bank_index(), 0);
    assert_eq!(backend.created(HandleKind::DescriptorSet), 5);
    assert_eq!(cache.bank_usage(&layout), vec![(4, 4, 0), (1, 4, 0)]);
}

#[test]
fn distinct_layouts_get_distinct_pools() {
    init_test_logger();
    let backend = Arc::new(MockBackend::new());
    let layouts = LayoutCache::new(backend.clone());
    let uniforms = set_layout(&layouts, DescriptorType::UniformBuffer);
    let storage = set_layout(&layouts, DescriptorType::StorageBuffer);
    let cache = DescriptorSetCache::new(backend.clone(), 8);

    let a = cache.allocate(&uniforms).unwrap();
    let b = cache.allocate(&storage).unwrap();
    assert_ne!(a.handle(), b.handle());
    assert_eq!(cache.bank_usage(&uniforms), vec![(1, 8, 0)]);
    assert_eq!(cache.bank_usage(&storage), vec![(1, 8, 0)]);
    assert_eq!(backend.created(HandleKind::DescriptorPool), 2);
    assert_eq!(cache.snapshot().pools.len(), 2);
}

// ============================================================================
// Deferred Release
// ============================================================================

#[test]
fn frame_deferred_release_waits_for_the_slot() {
    let (backend, cache, layout) = setup(4);
    let ring = FrameRing::new(backend.clone(), 2).unwrap();

    let set = cache.allocate(&layout).unwrap();
    let mut frame = ring.begin_frame();
    frame.queue_destroy(set);
    assert!(frame.surface().is_some());
    frame.end(Vec::new());
    assert_eq!(cache.bank_usage(&layout), vec![(1, 4, 0)]);

    let mut frame = ring.begin_frame();
    assert!(frame.surface().is_some());
    frame.end(Vec::new());
    assert_eq!(cache.bank_usage(&layout), vec![(1, 4, 0)]);

    // slot 0 comes around again
    let frame = ring.begin_frame();
    assert_eq!(cache.bank_usage(&layout), vec![(1, 4, 1)]);
    frame.cancel();

    assert_eq!(cache.destroy_all(), 1);
    assert_eq!(backend.live(HandleKind::DescriptorSet), 0);
}
