//! Descriptor Pool Banks
//!
//! Descriptor sets are allocated from fixed-capacity *banks*. Each distinct
//! set layout owns one pool, which is an append-only list of banks:
//!
//! ```text
//! layout key ──► DescriptorPool ──► [bank_0 (4/4), bank_1 (1/4, free: [])]
//! ```
//!
//! `allocate` scans the banks in insertion order and takes the first that has
//! a released set on its free list or spare capacity, preferring the free
//! list. Only when every bank is exhausted is a new bank created, sized
//! `bank_size × count` for each binding of the layout.
//!
//! Banks are never shrunk, merged or rebalanced. `release` is O(1) and does
//! not know about the GPU: a set that in-flight work may still read must be
//! released through a frame's deferred destroyers instead.
//!
//! Every bank carries an id that is never reused by the cache. A set records
//! the id of the bank it came from, so releasing a set whose bank was
//! destroyed is a no-op even when a new bank took its index.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cinder_core::{
    BackendContext, CacheKey, CinderError, CreateRequest, DescriptorPoolHandle,
    DescriptorResource, DescriptorSetHandle, DescriptorWrite, Result, SharedBackend,
};
use cinder_sync::Destroyer;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::layout::DescriptorSetLayout;

struct PoolBank {
    id: u64,
    name: String,
    handle: DescriptorPoolHandle,
    len: u32,
    cap: u32,
    free_sets: Vec<DescriptorSetHandle>,
}

impl PoolBank {
    #[inline]
    fn can_allocate(&self) -> bool {
        !self.free_sets.is_empty() || self.len < self.cap
    }
}

struct DescriptorPool {
    banks: Vec<PoolBank>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BankSnapshot {
    pub name: String,
    pub pool: String,
    pub len: u32,
    pub cap: u32,
    pub free_sets: Vec<String>,
}

/// Serializable view of every pool, keyed by set layout key.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptorSetCacheSnapshot {
    pub pools: BTreeMap<String, Vec<BankSnapshot>>,
}

/// Routes set layouts to pools, pools to banks and banks to sets.
pub struct DescriptorSetCache {
    backend: SharedBackend,
    bank_size: u32,
    next_bank_id: AtomicU64,
    pools: Mutex<FxHashMap<CacheKey, DescriptorPool>>,
}

impl DescriptorSetCache {
    #[must_use]
    pub fn new(backend: SharedBackend, bank_size: u32) -> Arc<Self> {
        Arc::new(Self {
            backend,
            bank_size,
            next_bank_id: AtomicU64::new(1),
            pools: Mutex::default(),
        })
    }

    #[must_use]
    pub fn bank_size(&self) -> u32 {
        self.bank_size
    }

    /// Allocates a set of `layout`, reusing released sets first.
    ///
    /// Backend failures while growing a bank are returned with the bank name
    /// and requested sizes as context.
    pub fn allocate(self: &Arc<Self>, layout: &Arc<DescriptorSetLayout>) -> Result<DescriptorSet> {
        let mut pools = self.pools.lock();
        let pool = pools
            .entry(layout.key().clone())
            .or_insert_with(|| DescriptorPool { banks: Vec::new() });

        let bank = match pool.banks.iter().position(PoolBank::can_allocate) {
            Some(i) => i,
            None => {
                let bank = self.new_bank(layout, pool.banks.len())?;
                pool.banks.push(bank);
                pool.banks.len() - 1
            }
        };

        let b = &mut pool.banks[bank];
        let bank_id = b.id;
        let handle = if let Some(handle) = b.free_sets.pop() {
            log::trace!("Reusing descriptor set {handle} from {} of {}", b.name, layout.name());
            handle
        } else {
            let name = format!("{}_{}_set_{}", layout.name(), b.name, b.len);
            let h = self
                .backend
                .create_handle(&CreateRequest::DescriptorSet {
                    name: &name,
                    pool: b.handle,
                    layout: layout.handle(),
                })
                .context(|| format!("allocating descriptor set {name}"))?;
            b.len += 1;
            DescriptorSetHandle::from_handle(h)
        };
        drop(pools);

        Ok(DescriptorSet {
            owner: self.clone(),
            layout: layout.clone(),
            handle,
            bank,
            bank_id,
        })
    }

    fn new_bank(&self, layout: &DescriptorSetLayout, index: usize) -> Result<PoolBank> {
        let bank_name = format!("bank_{index}");
        let pool_sizes = layout.pool_sizes(self.bank_size)?;
        let name = format!("{}_{bank_name}_maxSets_{}", layout.name(), self.bank_size);
        let h = self
            .backend
            .create_handle(&CreateRequest::DescriptorPool {
                name: &name,
                max_sets: self.bank_size,
                pool_sizes: &pool_sizes,
            })
            .context(|| format!("creating descriptor pool {name} ({pool_sizes:?})"))?;
        log::debug!("Grew descriptor pool for {} with {bank_name}", layout.name());
        Ok(PoolBank {
            id: self.next_bank_id.fetch_add(1, Ordering::Relaxed),
            name: bank_name,
            handle: DescriptorPoolHandle::from_handle(h),
            len: 0,
            cap: self.bank_size,
            free_sets: Vec::new(),
        })
    }

    /// Returns a set to its bank's free list.
    pub fn release(&self, set: DescriptorSet) {
        let mut pools = self.pools.lock();
        let Some(bank) = pools
            .get_mut(set.layout.key())
            .and_then(|p| p.banks.get_mut(set.bank))
            .filter(|b| b.id == set.bank_id)
        else {
            log::debug!("Released descriptor set {} after its pool was destroyed", set.handle);
            return;
        };
        debug_assert!(
            !bank.free_sets.contains(&set.handle),
            "descriptor set {} released twice",
            set.handle
        );
        bank.free_sets.push(set.handle);
    }

    /// Number of banks backing `layout`.
    #[must_use]
    pub fn bank_count(&self, layout: &DescriptorSetLayout) -> usize {
        self.pools
            .lock()
            .get(layout.key())
            .map_or(0, |p| p.banks.len())
    }

    /// `(len, cap, free)` of every bank backing `layout`.
    #[must_use]
    pub fn bank_usage(&self, layout: &DescriptorSetLayout) -> Vec<(u32, u32, usize)> {
        self.pools.lock().get(layout.key()).map_or_else(Vec::new, |p| {
            p.banks
                .iter()
                .map(|b| (b.len, b.cap, b.free_sets.len()))
                .collect()
        })
    }

    /// Destroys every bank, which also frees every set allocated from it.
    ///
    /// Only valid once the device is idle.
    pub fn destroy_all(&self) -> usize {
        let pools: Vec<_> = self.pools.lock().drain().collect();
        let mut n = 0;
        for (key, pool) in pools {
            for bank in pool.banks {
                log::trace!("Destroying descriptor pool {} of {key}", bank.name);
                self.backend.destroy_handle(bank.handle.into());
                n += 1;
            }
        }
        n
    }

    #[must_use]
    pub fn snapshot(&self) -> DescriptorSetCacheSnapshot {
        let pools = self
            .pools
            .lock()
            .iter()
            .map(|(key, pool)| {
                let banks = pool
                    .banks
                    .iter()
                    .map(|b| BankSnapshot {
                        name: b.name.clone(),
                        pool: b.handle.to_string(),
                        len: b.len,
                        cap: b.cap,
                        free_sets: b.free_sets.iter().map(ToString::to_string).collect(),
                    })
                    .collect();
                (key.as_str().to_owned(), banks)
            })
            .collect();
        DescriptorSetCacheSnapshot { pools }
    }
}

/// A descriptor set allocated from a pool bank.
///
/// Not `Clone`: [`release`](Self::release) consumes it, so a set cannot be
/// released twice. Dropping a set without releasing it keeps its slot
/// reserved until the pool is destroyed.
pub struct DescriptorSet {
    owner: Arc<DescriptorSetCache>,
    layout: Arc<DescriptorSetLayout>,
    handle: DescriptorSetHandle,
    bank: usize,
    bank_id: u64,
}

impl DescriptorSet {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> DescriptorSetHandle {
        self.handle
    }

    #[must_use]
    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    #[must_use]
    pub fn bank_index(&self) -> usize {
        self.bank
    }

    /// Writes `resources` into `binding` starting at array element
    /// `first_element`.
    pub fn write(
        &self,
        binding: u32,
        first_element: u32,
        resources: &[DescriptorResource],
    ) -> Result<()> {
        let max = self.layout.bindings().len();
        if binding as usize >= max {
            return Err(CinderError::validation(format!(
                "writing binding {binding} while layout {} has {max} bindings",
                self.layout.name()
            )));
        }
        let Some(slot) = self.layout.binding(binding) else {
            return Err(CinderError::validation(format!(
                "binding {binding} of layout {} is empty",
                self.layout.name()
            )));
        };
        if resources.is_empty() {
            return Err(CinderError::validation("writing zero descriptors"));
        }
        if u64::from(first_element) + resources.len() as u64 > u64::from(slot.count) {
            return Err(CinderError::validation(format!(
                "writing {} descriptors at element {first_element} while binding {binding} holds {}",
                resources.len(),
                slot.count
            )));
        }
        if let Some(bad) = resources.iter().find(|r| !r.matches(slot.descriptor_type)) {
            return Err(CinderError::validation(format!(
                "{bad:?} cannot be written to a {} binding",
                slot.descriptor_type
            )));
        }

        self.owner.backend.update_descriptor_set(&DescriptorWrite {
            set: self.handle,
            binding,
            first_element,
            descriptor_type: slot.descriptor_type,
            resources,
        });
        Ok(())
    }

    /// Returns the set to its bank immediately.
    pub fn release(self) {
        let owner = self.owner.clone();
        owner.release(self);
    }
}

impl Destroyer for DescriptorSet {
    fn destroy(self: Box<Self>) {
        (*self).release();
    }
}

impl fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("handle", &self.handle)
            .field("layout", &self.layout.name())
            .field("bank", &self.bank)
            .finish()
    }
}
