use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::backend::{Dialect, KernelBackend};
use crate::ipsets::{self, IpSetManager, ReferenceKind, SetKind, SetMetadata, SetType};
use crate::metrics::Metrics;
use crate::policies::{self, JumpPosition, NetworkPolicy, PolicyManager, TranslatedSet};

#[cfg(test)]
mod tests;

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// seconds iptables waits for the xtables lock
    #[serde(default = "default_lock_wait")]
    pub lock_wait: u32,
    #[serde(default)]
    pub jump_position: JumpPosition,
    /// iptables flavor, detected when not set
    #[serde(default)]
    pub dialect: Option<Dialect>,
    /// submissions of a batch before giving up on it
    #[serde(default = "default_apply_max_tries")]
    pub apply_max_tries: usize,
}

fn default_lock_wait() -> u32 {
    60
}
fn default_apply_max_tries() -> usize {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait: default_lock_wait(),
            jump_position: JumpPosition::default(),
            dialect: None,
            apply_max_tries: default_apply_max_tries(),
        }
    }
}

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sets: {0}")]
    IpSets(#[from] ipsets::Error),
    #[error("policies: {0}")]
    Policies(#[from] policies::Error),
}

pub struct Dataplane {
    ipsets: IpSetManager,
    policies: PolicyManager,
    metrics: Arc<Metrics>,
}

impl Dataplane {
    pub fn new(backend: Arc<dyn KernelBackend>, config: &Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            ipsets: IpSetManager::new(backend.clone(), metrics.clone(), config.apply_max_tries),
            policies: PolicyManager::new(
                backend,
                metrics.clone(),
                config.apply_max_tries,
                config.jump_position,
            ),
            metrics,
        }
    }

    pub fn ipsets(&self) -> &IpSetManager {
        &self.ipsets
    }

    pub fn policies(&self) -> &PolicyManager {
        &self.policies
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Clean every kernel object we own and install the skeleton chains.
    pub fn bootup(&self) -> Result {
        info!("booting up the dataplane");
        self.policies.reset()?;
        self.ipsets.reset()?;
        self.policies.initialize_chains()?;
        Ok(())
    }

    pub fn create_sets(&self, sets: &[SetMetadata]) {
        self.ipsets.create_sets(sets);
    }

    /// Delete the set from the cache. A set still in use is kept.
    pub fn delete_set(&self, set: &SetMetadata) -> Result {
        match self.ipsets.delete_set(&set.prefixed_name()) {
            Err(ipsets::Error::NotDeletable(name)) => {
                debug!("set {name} still in use, not deleting it");
                Ok(())
            }
            result => Ok(result?),
        }
    }

    pub fn add_to_sets(&self, sets: &[SetMetadata], ip: &str, owner: &str) -> Result {
        Ok(self.ipsets.add_to_sets(sets, ip, owner)?)
    }

    pub fn remove_from_sets(&self, sets: &[SetMetadata], ip: &str, owner: &str) -> Result {
        Ok(self.ipsets.remove_from_sets(sets, ip, owner)?)
    }

    pub fn add_to_lists(&self, lists: &[SetMetadata], members: &[SetMetadata]) -> Result {
        Ok(self.ipsets.add_to_lists(lists, members)?)
    }

    pub fn remove_from_list(&self, list: &SetMetadata, members: &[SetMetadata]) -> Result {
        Ok(self.ipsets.remove_from_list(list, members)?)
    }

    /// Push the pending set changes, and retry the removal of chains left in use.
    pub fn apply_dataplane(&self) -> Result {
        self.ipsets.apply()?;
        self.policies.cleanup_stale()?;
        Ok(())
    }

    /// Program the policy and the sets it needs. On failure, the policy ends absent.
    pub fn add_policy(&self, policy: &NetworkPolicy) -> Result {
        let key = policy.key();
        if self.policies.is_registered(&key) {
            self.remove_policy(&key)?;
        }
        info!("adding policy {key}");

        if let Err(e) = self.acquire_sets(policy) {
            self.rollback(policy);
            return Err(e);
        }

        if let Err(e) = self.apply_sets() {
            error!("failed to apply the sets of policy {key}: {e}");
            self.rollback(policy);
            return Err(e);
        }

        if let Err(e) = self.policies.add_policy(policy) {
            self.rollback(policy);
            return Err(e.into());
        }
        Ok(())
    }

    /// Unprogram the policy and release its sets. Removing an unknown policy is a no-op.
    pub fn remove_policy(&self, key: &str) -> Result {
        let Some(policy) = self.policies.get_policy(key) else {
            info!("policy {key} not found, it may have been removed already");
            return Ok(());
        };
        info!("removing policy {key}");

        self.policies.remove_policy(key)?;
        self.release_sets(&policy.rule_sets, key, ReferenceKind::NetPol)?;
        self.release_sets(&policy.pod_selector_sets, key, ReferenceKind::Selector)?;
        self.apply_sets()
    }

    /// Replace the policy when it changed, add it when absent.
    pub fn update_policy(&self, policy: &NetworkPolicy) -> Result {
        let key = policy.key();
        match self.policies.get_policy(&key) {
            None => self.add_policy(policy),
            Some(current) if current.is_equivalent(policy) => {
                debug!("policy {key} unchanged");
                Ok(())
            }
            Some(_) => {
                self.remove_policy(&key)?;
                self.add_policy(policy)
            }
        }
    }

    /// Periodic repair of what other agents may have changed.
    pub fn reconcile(&self) -> Result {
        self.policies.reconcile()?;
        Ok(())
    }

    /// Apply the sets. Destroys still pending stay dirty for the next apply.
    fn apply_sets(&self) -> Result {
        match self.ipsets.apply() {
            Err(ipsets::Error::InUse(names)) => {
                warn!("sets still in use, will retry: {}", names.join(", "));
                Ok(())
            }
            result => Ok(result?),
        }
    }

    fn acquire_sets(&self, policy: &NetworkPolicy) -> Result {
        let key = policy.key();
        self.acquire(&policy.pod_selector_sets, &key, ReferenceKind::Selector)?;
        self.acquire(&policy.rule_sets, &key, ReferenceKind::NetPol)
    }

    fn acquire(&self, sets: &[TranslatedSet], owner: &str, kind: ReferenceKind) -> Result {
        for set in sets {
            self.ipsets.create_sets(std::slice::from_ref(&set.metadata));
            self.ipsets.add_reference(&set.metadata, owner, kind)?;
        }

        for set in sets.iter().filter(|s| !s.members.is_empty()) {
            let metadata = std::slice::from_ref(&set.metadata);
            match set.metadata.kind() {
                SetKind::Hash => {
                    for member in &set.members {
                        self.ipsets.add_to_sets(metadata, member, "")?;
                    }
                }
                SetKind::List => {
                    let current = self.list_members(&set.metadata);
                    let members: Vec<SetMetadata> = (set.members.iter())
                        .map(|name| list_member(name))
                        .filter(|m| !current.contains(&m.prefixed_name()))
                        .collect();
                    self.ipsets.create_sets(&members);
                    self.ipsets.add_to_lists(metadata, &members)?;
                }
            }
        }
        Ok(())
    }

    /// Drop the policy's references, and the policy-defined members of sets no policy uses
    /// anymore, then delete the sets that became unused.
    fn release_sets(&self, sets: &[TranslatedSet], owner: &str, kind: ReferenceKind) -> Result {
        for set in sets {
            let Some(current) = self.ipsets.get(&set.metadata.prefixed_name()) else {
                continue;
            };
            if current.is_referenced_by(owner, kind) {
                self.ipsets.delete_reference(&set.metadata, owner, kind)?;
            }
        }

        for set in sets {
            let Some(current) = self.ipsets.get(&set.metadata.prefixed_name()) else {
                continue;
            };
            if current.selector_refs() > 0 || current.netpol_refs() > 0 {
                continue;
            }

            let metadata = std::slice::from_ref(&set.metadata);
            match set.metadata.kind() {
                SetKind::Hash => {
                    for member in &set.members {
                        self.ipsets.remove_from_sets(metadata, member, "")?;
                    }
                }
                SetKind::List => {
                    let present = current.list_members().cloned().unwrap_or_default();
                    let members: Vec<SetMetadata> = (set.members.iter())
                        .map(|name| list_member(name))
                        .filter(|m| present.contains(&m.prefixed_name()))
                        .collect();
                    if !members.is_empty() {
                        self.ipsets.remove_from_list(&set.metadata, &members)?;
                    }
                    for member in &members {
                        self.delete_set(member)?;
                    }
                }
            }
            self.delete_set(&set.metadata)?;
        }
        Ok(())
    }

    fn rollback(&self, policy: &NetworkPolicy) {
        let key = policy.key();
        let released = (self.release_sets(&policy.rule_sets, &key, ReferenceKind::NetPol))
            .and_then(|()| {
                self.release_sets(&policy.pod_selector_sets, &key, ReferenceKind::Selector)
            });
        if let Err(e) = released {
            warn!("failed to release the sets of policy {key}: {e}");
        }
    }

    fn list_members(&self, list: &SetMetadata) -> Vec<String> {
        (self.ipsets.get(&list.prefixed_name()))
            .and_then(|set| set.list_members().cloned())
            .map(|members| members.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Members of policy-defined lists are pod label sets.
fn list_member(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::KeyValueLabelOfPod)
}
