//! Object cache tests
//!
//! Tests for:
//! - Exactly one surviving handle per key under concurrent misses
//! - Layout derivation reusing cached set layouts
//! - Pipeline relinking with a balanced create/destroy count

use std::sync::{Arc, Barrier};
use std::time::Duration;

use cinder::cinder_cache::{LayoutCache, ObjectCache, Outcome, PipelineCache};
use cinder::cinder_core::{
    BackendContext, CacheKey, CreateRequest, DescriptorCount, DescriptorType, GpuBackend,
    HandleKind, PipelineLayoutCreateInfo, PipelineLayoutHandle, PushConstantRange, Result,
    ShaderBinding, ShaderLayout, ShaderStage,
};
use cinder::cinder_sync::{DestroyerQueue, run_destroyers};
use cinder::PipelineDesc;
use cinder_dev_utils::{MockBackend, init_test_logger};
use smallvec::SmallVec;

// ============================================================================
// Helpers
// ============================================================================

fn backend() -> Arc<MockBackend> {
    init_test_logger();
    Arc::new(MockBackend::new())
}

fn create_layout(backend: &MockBackend) -> Result<PipelineLayoutHandle> {
    let h = backend
        .create_handle(&CreateRequest::PipelineLayout {
            name: "race",
            set_layouts: &[],
            push_constants: None,
        })
        .context(|| "creating pipeline layout".into())?;
    Ok(PipelineLayoutHandle::from_handle(h))
}

fn binding(descriptor_type: DescriptorType, count: u32) -> ShaderBinding {
    ShaderBinding {
        descriptor_type,
        count: DescriptorCount::fixed(count),
    }
}

// ============================================================================
// Concurrent Misses
// ============================================================================

#[test]
fn concurrent_misses_leave_one_survivor() {
    const T: usize = 8;
    let backend = backend();
    backend.set_create_delay(Duration::from_millis(20));
    let cache = Arc::new(ObjectCache::new("pipeline_layouts", backend.clone()));
    let key = CacheKey::new("[0x0,0,0][null]");
    let barrier = Arc::new(Barrier::new(T));

    let threads: Vec<_> = (0..T)
        .map(|_| {
            let (backend, cache, key, barrier) =
                (backend.clone(), cache.clone(), key.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                cache.resolve(&key, || create_layout(&backend))
            })
        })
        .collect();
    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let winner = results[0].0;
    assert!(results.iter().all(|(h, _)| *h == winner));
    let created = results.iter().filter(|(_, o)| *o == Outcome::Created).count();
    let discarded = results.iter().filter(|(_, o)| *o == Outcome::Discarded).count();
    assert_eq!(created, 1);

    let stats = cache.stats();
    assert_eq!(stats.discarded as usize, discarded);
    assert_eq!(stats.misses as usize, created + discarded);
    assert_eq!(
        backend.created(HandleKind::PipelineLayout),
        backend.destroyed(HandleKind::PipelineLayout) + 1
    );
    assert_eq!(backend.live(HandleKind::PipelineLayout), 1);
    assert_eq!(cache.get(&key), Some(winner));
}

#[test]
fn concurrent_layout_requests_share_handles() {
    const T: usize = 6;
    let backend = backend();
    backend.set_create_delay(Duration::from_millis(5));
    let layouts = Arc::new(LayoutCache::new(backend.clone()));
    let barrier = Arc::new(Barrier::new(T));

    let threads: Vec<_> = (0..T)
        .map(|_| {
            let (layouts, barrier) = (layouts.clone(), barrier.clone());
            std::thread::spawn(move || {
                let shader = ShaderLayout {
                    push_constants: PushConstantRange { offset: 0, size: 16 },
                    descriptor_set_layouts: vec![vec![binding(DescriptorType::UniformBuffer, 1)]],
                };
                barrier.wait();
                layouts
                    .create_pipeline_layout(&[PipelineLayoutCreateInfo {
                        shader_layout: &shader,
                        stage: ShaderStage::VERTEX,
                        spec_constants: &[],
                    }])
                    .unwrap()
                    .handle()
            })
        })
        .collect();
    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(backend.live(HandleKind::PipelineLayout), 1);
    assert_eq!(backend.live(HandleKind::DescriptorSetLayout), 1);
}

// ============================================================================
// Layout Derivation
// ============================================================================

#[test]
fn stages_merge_into_one_layout() {
    let backend = backend();
    let layouts = LayoutCache::new(backend.clone());
    let vertex = ShaderLayout {
        push_constants: PushConstantRange { offset: 0, size: 64 },
        descriptor_set_layouts: vec![vec![binding(DescriptorType::UniformBuffer, 1)]],
    };
    let fragment = ShaderLayout {
        push_constants: PushConstantRange { offset: 0, size: 64 },
        descriptor_set_layouts: vec![vec![
            binding(DescriptorType::UniformBuffer, 1),
            binding(DescriptorType::CombinedImageSampler, 2),
        ]],
    };
    let layout = layouts
        .create_pipeline_layout(&[
            PipelineLayoutCreateInfo {
                shader_layout: &vertex,
                stage: ShaderStage::VERTEX,
                spec_constants: &[],
            },
            PipelineLayoutCreateInfo {
                shader_layout: &fragment,
                stage: ShaderStage::FRAGMENT,
                spec_constants: &[],
            },
        ])
        .unwrap();

    assert_eq!(
        layout.key().as_str(),
        "[0x11,0,64][0x11:0x6:1,0x10:0x1:2]"
    );
    let set = layout.set_layout(0).unwrap();
    assert_eq!(set.binding(1).unwrap().stages, ShaderStage::FRAGMENT);
    assert!(layout.validate_push_constants(0, 64).is_ok());
    assert!(layout.validate_push_constants(32, 64).is_err());

    // wider stage visibility is a different layout
    let again = layouts
        .create_pipeline_layout(&[PipelineLayoutCreateInfo {
            shader_layout: &fragment,
            stage: ShaderStage::FRAGMENT | ShaderStage::VERTEX,
            spec_constants: &[],
        }])
        .unwrap();
    assert_eq!(again.key().as_str(), "[0x11,0,64][0x11:0x6:1,0x11:0x1:2]");
    assert_eq!(backend.created(HandleKind::PipelineLayout), 2);
    assert_eq!(layouts.pipeline_layouts().stats().hits, 0);
}

// ============================================================================
// Pipeline Relinking
// ============================================================================

#[test]
fn relink_destroys_exactly_one_fast_pipeline() {
    let backend = backend();
    let mailbox = DestroyerQueue::new();
    let pipelines = PipelineCache::new(backend.clone(), mailbox.sender(), 2).unwrap();
    let shader = ShaderLayout::default();
    let layout = LayoutCache::new(backend.clone())
        .create_pipeline_layout(&[PipelineLayoutCreateInfo {
            shader_layout: &shader,
            stage: ShaderStage::VERTEX | ShaderStage::FRAGMENT,
            spec_constants: &[],
        }])
        .unwrap();

    let desc = |shader: &str, stage| PipelineDesc {
        shader: shader.to_owned(),
        entry_point: "main".to_owned(),
        stage,
        layout: layout.clone(),
        spec_constants: SmallVec::new(),
    };
    let vs = pipelines.create_pipeline(&desc("mesh.vert", ShaderStage::VERTEX));
    let fs = pipelines.create_pipeline(&desc("mesh.frag", ShaderStage::FRAGMENT));

    backend.hold_optimized_links();
    let fast = pipelines.link(&layout, &[vs.clone(), fs.clone()]);
    // rendering keeps the fast handle while optimization is pending
    assert_eq!(pipelines.link(&layout, &[vs, fs]).handle(), fast.handle());
    assert_eq!(pipelines.pending_relinks(), 1);
    backend.release_optimized_links();
    pipelines.flush_relinks();

    let optimized = pipelines.current(&fast).unwrap();
    assert_ne!(optimized, fast.handle());
    assert_eq!(mailbox.len(), 1);
    assert_eq!(run_destroyers(mailbox.drain()), 1);
    assert!(!backend.is_live(fast.handle().into()));
    assert!(backend.is_live(optimized.into()));

    assert_eq!(pipelines.destroy_all(), 3);
    assert_eq!(
        backend.created(HandleKind::Pipeline),
        backend.destroyed(HandleKind::Pipeline)
    );
}
