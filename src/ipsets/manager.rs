use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use super::apply::{Plan, destroy_all};
use super::cache::{Cache, Dirty};
use super::{IpSet, ReferenceKind, Result, SetMetadata};
use crate::backend::KernelBackend;
use crate::metrics::Metrics;

/// The set cache behind its lock, with the means to apply it.
pub struct IpSetManager {
    backend: Arc<dyn KernelBackend>,
    metrics: Arc<Metrics>,
    max_tries: usize,
    cache: Mutex<Cache>,
}

fn names(sets: &[SetMetadata]) -> Vec<String> {
    sets.iter().map(SetMetadata::prefixed_name).collect()
}

impl IpSetManager {
    pub fn new(backend: Arc<dyn KernelBackend>, metrics: Arc<Metrics>, max_tries: usize) -> Self {
        Self {
            backend,
            metrics,
            max_tries,
            cache: Mutex::new(Cache::new()),
        }
    }

    /// Direct access to the cache, for inspection.
    pub fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock()
    }

    pub fn get(&self, name: &str) -> Option<IpSet> {
        self.cache.lock().get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.cache.lock().exists(name)
    }

    pub fn dirty(&self) -> Dirty {
        self.cache.lock().dirty().clone()
    }

    pub fn create_sets(&self, sets: &[SetMetadata]) {
        let mut cache = self.cache.lock();
        for set in sets {
            cache.create_set(set);
        }
    }

    pub fn delete_set(&self, name: &str) -> Result {
        self.cache.lock().delete_set(name)
    }

    pub fn add_to_sets(&self, sets: &[SetMetadata], member: &str, owner: &str) -> Result {
        self.cache.lock().add_member(&names(sets), member, owner)
    }

    pub fn remove_from_sets(&self, sets: &[SetMetadata], member: &str, owner: &str) -> Result {
        self.cache.lock().remove_member(&names(sets), member, owner)
    }

    pub fn add_to_lists(&self, lists: &[SetMetadata], members: &[SetMetadata]) -> Result {
        let members = names(members);
        let mut cache = self.cache.lock();
        for list in lists {
            cache.add_to_list(&list.prefixed_name(), &members)?;
        }
        Ok(())
    }

    pub fn remove_from_list(&self, list: &SetMetadata, members: &[SetMetadata]) -> Result {
        (self.cache.lock()).remove_from_list(&list.prefixed_name(), &names(members))
    }

    pub fn add_reference(&self, set: &SetMetadata, owner: &str, kind: ReferenceKind) -> Result {
        (self.cache.lock()).add_reference(&set.prefixed_name(), owner, kind)
    }

    pub fn delete_reference(&self, set: &SetMetadata, owner: &str, kind: ReferenceKind) -> Result {
        (self.cache.lock()).delete_reference(&set.prefixed_name(), owner, kind)
    }

    /// Push the dirty sets to the kernel. The lock is held during the kernel call.
    pub fn apply(&self) -> Result {
        let mut cache = self.cache.lock();
        if cache.dirty().is_empty() {
            debug!("no set change to apply");
            return Ok(());
        }

        let Plan {
            batch,
            updated,
            deleted,
        } = cache.plan();
        info!(
            "applying sets: {} to add or update, {} to delete ({} lines)",
            updated.len(),
            deleted.len(),
            batch.len()
        );

        let outcome = batch.run(self.backend.as_ref(), self.max_tries);
        cache.settle(&updated, &deleted, &outcome);

        let ok = outcome.error.is_none() && outcome.deferred.is_empty();
        self.metrics.set_apply(ok, outcome.retries);
        self.metrics.set_counts(cache.len(), cache.kernel_len());

        Cache::outcome_result(outcome)
    }

    /// Destroy every set we own in the kernel, including the ones of previous runs, and
    /// start from an empty cache.
    pub fn reset(&self) -> Result {
        let mut cache = self.cache.lock();
        destroy_all(self.backend.as_ref(), self.max_tries)?;
        *cache = Cache::new();
        self.metrics.set_counts(0, 0);
        Ok(())
    }
}
