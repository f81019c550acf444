use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Arc;

use super::chains::{self, JumpPlan, JumpPosition, JumpState};
use super::rules::{self, FORWARD_JUMP};
use super::{Direction, Error, NetworkPolicy, Result};
use crate::backend::{KernelBackend, Output, Tool};
use crate::batch::{self, Batch, ErrorKind, Handling, Outcome};
use crate::metrics::Metrics;

/// Upper bound on duplicate FORWARD jumps removed by a reset.
const MAX_JUMP_DELETES: usize = 16;

/// Legacy iptables gives no usable cause when a jump to delete is missing.
fn on_jump_delete(_: ErrorKind) -> Handling {
    Handling::Ignore
}

fn on_chain_flush(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist => Handling::IgnoreSection,
        ErrorKind::InUse => Handling::Defer,
        _ => Handling::Fail,
    }
}

fn on_chain_destroy(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist => Handling::Ignore,
        ErrorKind::InUse => Handling::Defer,
        _ => Handling::Fail,
    }
}

fn on_reset_flush(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist => Handling::IgnoreSection,
        _ => Handling::Fail,
    }
}

fn on_reset_destroy(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist => Handling::Ignore,
        _ => Handling::Fail,
    }
}

#[derive(Default)]
struct State {
    policies: Map<String, NetworkPolicy>,
    /// per-policy chains whose destroy was deferred
    stale_chains: Set<String>,
}

impl State {
    fn count(&self, direction: Direction) -> usize {
        (self.policies.values())
            .filter(|p| match direction {
                Direction::Egress => p.has_egress(),
                _ => p.has_ingress(),
            })
            .count()
    }
}

/// Registry of programmed policies and owner of our iptables chains.
pub struct PolicyManager {
    backend: Arc<dyn KernelBackend>,
    metrics: Arc<Metrics>,
    max_tries: usize,
    jump_position: JumpPosition,
    state: Mutex<State>,
}

impl PolicyManager {
    pub fn new(
        backend: Arc<dyn KernelBackend>,
        metrics: Arc<Metrics>,
        max_tries: usize,
        jump_position: JumpPosition,
    ) -> Self {
        Self {
            backend,
            metrics,
            max_tries,
            jump_position,
            state: Mutex::new(State::default()),
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.state.lock().policies.contains_key(key)
    }

    pub fn get_policy(&self, key: &str) -> Option<NetworkPolicy> {
        self.state.lock().policies.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().policies.is_empty()
    }

    pub fn stale_chains(&self) -> Vec<String> {
        self.state.lock().stale_chains.iter().cloned().collect()
    }

    /// Program the policy's chains and jumps, replacing a registered policy with the same key.
    pub fn add_policy(&self, policy: &NetworkPolicy) -> Result {
        let mut state = self.state.lock();
        if state.policies.contains_key(&policy.key()) {
            self.remove_locked(&mut state, &policy.key())?;
        }
        self.add_locked(&mut state, policy)
    }

    /// Unprogram the policy. Removing an unknown policy is a no-op.
    pub fn remove_policy(&self, key: &str) -> Result {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, key)
    }

    /// Add the policy when absent, replace it when it changed.
    pub fn update_policy(&self, policy: &NetworkPolicy) -> Result {
        let key = policy.key();
        let mut state = self.state.lock();
        let unchanged = (state.policies.get(&key)).map(|current| current.is_equivalent(policy));
        match unchanged {
            None => self.add_locked(&mut state, policy),
            Some(true) => {
                debug!("policy {key} unchanged");
                Ok(())
            }
            Some(false) => {
                self.remove_locked(&mut state, &key)?;
                self.add_locked(&mut state, policy)
            }
        }
    }

    fn add_locked(&self, state: &mut State, policy: &NetworkPolicy) -> Result {
        let key = policy.key();
        let section = Some(key.as_str());
        let ingress_chain = policy.ingress_chain();
        let egress_chain = policy.egress_chain();

        let mut batch = Batch::new(Tool::IpTables);
        batch.push(section, batch::fail, format!(":{ingress_chain} - -"));
        batch.push(section, batch::fail, format!(":{egress_chain} - -"));

        for acl in &policy.acls {
            if acl.direction.has_ingress() {
                let rule = rules::acl_rule(acl, Direction::Ingress);
                batch.push(section, batch::fail, format!("-A {ingress_chain} {rule}"));
            }
            if acl.direction.has_egress() {
                let rule = rules::acl_rule(acl, Direction::Egress);
                batch.push(section, batch::fail, format!("-A {egress_chain} {rule}"));
            }
        }

        for (direction, present) in [
            (Direction::Ingress, policy.has_ingress()),
            (Direction::Egress, policy.has_egress()),
        ] {
            if !present {
                continue;
            }
            let index = state.count(direction) + 1;
            batch.push(
                section,
                batch::fail,
                format!(
                    "-I {} {index} {}",
                    rules::dispatch_chain(direction),
                    rules::jump_rule(policy, direction)
                ),
            );
        }

        info!("adding policy {key} ({} lines)", batch.len());
        let outcome = batch.run(self.backend.as_ref(), self.max_tries);
        self.record(&outcome);
        if let Some(e) = outcome.error {
            error!("failed to add policy {key}: {e}");
            return Err(Error::Apply(e));
        }

        state.stale_chains.remove(&ingress_chain);
        state.stale_chains.remove(&egress_chain);
        state.policies.insert(key, policy.clone());
        self.metrics.set_policies(state.policies.len());
        Ok(())
    }

    fn remove_locked(&self, state: &mut State, key: &str) -> Result {
        let Some(policy) = state.policies.get(key) else {
            debug!("policy {key} not registered, nothing to remove");
            return Ok(());
        };

        let mut batch = Batch::new(Tool::IpTables);
        for (direction, present) in [
            (Direction::Ingress, policy.has_ingress()),
            (Direction::Egress, policy.has_egress()),
        ] {
            if present {
                batch.push(
                    None,
                    on_jump_delete,
                    format!(
                        "-D {} {}",
                        rules::dispatch_chain(direction),
                        rules::jump_rule(policy, direction)
                    ),
                );
            }
        }

        let chains = [policy.ingress_chain(), policy.egress_chain()];
        for chain in &chains {
            batch.push(Some(chain.as_str()), on_chain_flush, format!("-F {chain}"));
        }
        for chain in &chains {
            batch.push(Some(chain.as_str()), on_chain_destroy, format!("-X {chain}"));
        }

        info!("removing policy {key} ({} lines)", batch.len());
        let outcome = batch.run(self.backend.as_ref(), self.max_tries);
        self.record(&outcome);

        for chain in &outcome.deferred {
            warn!("chain {chain} still in use, will retry its removal");
            state.stale_chains.insert(chain.clone());
        }
        if let Some(e) = outcome.error {
            error!("failed to remove policy {key}: {e}");
            return Err(Error::Apply(e));
        }

        state.policies.remove(key);
        self.metrics.set_policies(state.policies.len());
        Ok(())
    }

    /// Declare the skeleton chains, restore the jumps of the registered policies and position
    /// the FORWARD jump.
    pub fn initialize_chains(&self) -> Result {
        let mut state = self.state.lock();
        let section = Some("skeleton");

        let mut batch = Batch::new(Tool::IpTables);
        for chain in rules::SKELETON_CHAINS {
            batch.push(section, batch::fail, format!(":{chain} - -"));
        }
        for (chain, rule) in rules::skeleton_rules() {
            batch.push(section, batch::fail, format!("-A {chain} {rule}"));
        }

        for direction in [Direction::Ingress, Direction::Egress] {
            let policies = (state.policies.values()).filter(|p| match direction {
                Direction::Egress => p.has_egress(),
                _ => p.has_ingress(),
            });
            for (index, policy) in policies.enumerate() {
                batch.push(
                    section,
                    batch::fail,
                    format!(
                        "-I {} {} {}",
                        rules::dispatch_chain(direction),
                        index + 1,
                        rules::jump_rule(policy, direction)
                    ),
                );
            }
        }

        info!("initializing chains ({} lines)", batch.len());
        let outcome = batch.run(self.backend.as_ref(), self.max_tries);
        self.record(&outcome);
        if let Some(e) = outcome.error {
            return Err(Error::Apply(e));
        }

        self.position_jump_locked(&mut state)?;
        Ok(())
    }

    /// Remove every chain we own, including the ones of previous runs, and forget the
    /// registered policies.
    pub fn reset(&self) -> Result {
        let mut state = self.state.lock();

        let jump_delete: Vec<&str> = ["-D", "FORWARD"]
            .into_iter()
            .chain(FORWARD_JUMP.split_whitespace())
            .collect();
        for _ in 0..MAX_JUMP_DELETES {
            if !self.iptables(&jump_delete)?.success() {
                break;
            }
        }

        let listing = self.checked(&["-t", "filter", "-n", "-L"])?;
        let chains = chains::parse_owned_chains(&listing);

        if !chains.is_empty() {
            info!("resetting {} chains", chains.len());
            let mut batch = Batch::new(Tool::IpTables);
            for chain in &chains {
                batch.push(Some(chain.as_str()), on_reset_flush, format!("-F {chain}"));
            }
            for chain in &chains {
                batch.push(Some(chain.as_str()), on_reset_destroy, format!("-X {chain}"));
            }

            let outcome = batch.run(self.backend.as_ref(), self.max_tries);
            self.record(&outcome);
            if let Some(e) = outcome.error {
                return Err(Error::Apply(e));
            }
        }

        state.policies.clear();
        state.stale_chains.clear();
        self.metrics.set_policies(0);
        Ok(())
    }

    /// Bring the FORWARD jump to its place. Returns the state it was found in.
    pub fn position_jump(&self) -> Result<JumpState> {
        let mut state = self.state.lock();
        self.position_jump_locked(&mut state)
    }

    /// The FORWARD chain is only read and changed under the state lock.
    fn position_jump_locked(&self, _: &mut State) -> Result<JumpState> {
        let listing = self.checked(&["-t", "filter", "-n", "-L", "FORWARD", "--line-numbers"])?;
        let JumpPlan { state, insert_at } =
            chains::plan_jump(&chains::parse_rules(&listing), self.jump_position);

        if state == JumpState::Correct {
            debug!("forward jump in place");
            return Ok(state);
        }

        if state == JumpState::Misplaced {
            warn!("forward jump misplaced, moving it to position {insert_at}");
            let args: Vec<&str> = ["-D", "FORWARD"]
                .into_iter()
                .chain(FORWARD_JUMP.split_whitespace())
                .collect();
            self.checked(&args)?;
        } else {
            info!("inserting forward jump at position {insert_at}");
        }

        let insert_at = insert_at.to_string();
        let args: Vec<&str> = ["-I", "FORWARD", insert_at.as_str()]
            .into_iter()
            .chain(FORWARD_JUMP.split_whitespace())
            .collect();
        self.checked(&args)?;
        Ok(state)
    }

    /// Retry the destroy of the chains left behind by policy removals.
    pub fn cleanup_stale(&self) -> Result {
        let mut state = self.state.lock();
        self.cleanup_stale_locked(&mut state)
    }

    fn cleanup_stale_locked(&self, state: &mut State) -> Result {
        if state.stale_chains.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new(Tool::IpTables);
        for chain in &state.stale_chains {
            batch.push(Some(chain.as_str()), on_chain_flush, format!("-F {chain}"));
        }
        for chain in &state.stale_chains {
            batch.push(Some(chain.as_str()), on_chain_destroy, format!("-X {chain}"));
        }

        info!("cleaning up {} stale chains", state.stale_chains.len());
        let outcome = batch.run(self.backend.as_ref(), self.max_tries);
        self.record(&outcome);

        state.stale_chains.retain(|chain| outcome.is_pending(chain));
        match outcome.error {
            Some(e) => Err(Error::Apply(e)),
            None => Ok(()),
        }
    }

    /// Periodic repair: jump position and stale chains.
    pub fn reconcile(&self) -> Result {
        let mut state = self.state.lock();
        self.position_jump_locked(&mut state)?;
        self.cleanup_stale_locked(&mut state)
    }

    fn record(&self, outcome: &Outcome) {
        (self.metrics).policy_apply(outcome.error.is_none(), outcome.retries);
    }

    fn iptables(&self, args: &[&str]) -> Result<Output> {
        (self.backend.exec(Tool::IpTables, args)).map_err(|e| Error::Exec {
            args: args.join(" "),
            message: e.to_string(),
        })
    }

    /// Run the command and return its stdout, failing on a non-zero exit.
    fn checked(&self, args: &[&str]) -> Result<String> {
        let output = self.iptables(args)?;
        if !output.success() {
            return Err(Error::Exec {
                args: args.join(" "),
                message: output.message(),
            });
        }
        Ok(output.stdout)
    }
}
