use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Dataplane counters. One instance is shared by the managers of a dataplane.
#[derive(Debug, Default)]
pub struct Metrics {
    sets: AtomicU64,
    kernel_sets: AtomicU64,
    policies: AtomicU64,
    set_applies: AtomicU64,
    set_apply_failures: AtomicU64,
    policy_applies: AtomicU64,
    policy_apply_failures: AtomicU64,
    retries: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub sets: u64,
    pub kernel_sets: u64,
    pub policies: u64,
    pub set_applies: u64,
    pub set_apply_failures: u64,
    pub policy_applies: u64,
    pub policy_apply_failures: u64,
    pub retries: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_counts(&self, sets: usize, kernel_sets: usize) {
        self.sets.store(sets as u64, Relaxed);
        self.kernel_sets.store(kernel_sets as u64, Relaxed);
    }

    pub fn set_policies(&self, policies: usize) {
        self.policies.store(policies as u64, Relaxed);
    }

    pub fn set_apply(&self, ok: bool, retries: usize) {
        count(&self.set_applies, &self.set_apply_failures, ok);
        self.retries.fetch_add(retries as u64, Relaxed);
    }

    pub fn policy_apply(&self, ok: bool, retries: usize) {
        count(&self.policy_applies, &self.policy_apply_failures, ok);
        self.retries.fetch_add(retries as u64, Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sets: self.sets.load(Relaxed),
            kernel_sets: self.kernel_sets.load(Relaxed),
            policies: self.policies.load(Relaxed),
            set_applies: self.set_applies.load(Relaxed),
            set_apply_failures: self.set_apply_failures.load(Relaxed),
            policy_applies: self.policy_applies.load(Relaxed),
            policy_apply_failures: self.policy_apply_failures.load(Relaxed),
            retries: self.retries.load(Relaxed),
        }
    }
}

fn count(ok_counter: &AtomicU64, failure_counter: &AtomicU64, ok: bool) {
    if ok {
        ok_counter.fetch_add(1, Relaxed);
    } else {
        failure_counter.fetch_add(1, Relaxed);
    }
}
