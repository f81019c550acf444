use log::{debug, warn};
use std::collections::BTreeSet as Set;

use super::applied::Applied;
use super::cache::Cache;
use super::{Error, Result};
use crate::backend::{KernelBackend, Tool};
use crate::batch::{self, Batch, ErrorKind, Handling, Outcome};
use crate::hash::{self, SET_PREFIX};

fn on_create(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::AlreadyExists => Handling::Ignore,
        _ => Handling::Fail,
    }
}

fn on_flush(kind: ErrorKind) -> Handling {
    match kind {
        // nothing left to destroy
        ErrorKind::DoesNotExist => Handling::IgnoreSection,
        _ => Handling::Fail,
    }
}

fn on_member_delete(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist | ErrorKind::MemberMissing => Handling::Ignore,
        _ => Handling::Fail,
    }
}

fn on_member_add(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::AlreadyExists => Handling::Ignore,
        _ => Handling::Fail,
    }
}

fn on_destroy(kind: ErrorKind) -> Handling {
    match kind {
        ErrorKind::DoesNotExist => Handling::Ignore,
        ErrorKind::InUse => Handling::Defer,
        _ => Handling::Fail,
    }
}

/// A set batch and the dirty names it covers.
pub(super) struct Plan {
    pub batch: Batch,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl Cache {
    /// Build the batch bringing the kernel to the cached state. Member changes are staged and
    /// must be settled with [`Cache::settle`].
    pub(super) fn plan(&mut self) -> Plan {
        let mut batch = Batch::new(Tool::IpSet);
        let updated: Vec<String> = self.dirty.to_add_or_update.iter().cloned().collect();
        let deleted: Vec<String> = self.dirty.to_delete.iter().cloned().collect();

        let mut diffs = Vec::with_capacity(updated.len());
        for name in &updated {
            let Some(set) = self.sets.get(name) else {
                continue;
            };
            let section = Some(name.as_str());
            batch.push(
                section,
                on_create,
                format!(
                    "-N {} -exist {}",
                    set.hashed_name,
                    set.metadata.set_type.kernel_spec()
                ),
            );

            let wanted = set.kernel_members();
            let hashed_name = set.hashed_name.clone();
            let applied = self.kernel.entry(name.clone()).or_insert_with(Applied::new);
            if !applied.is_known() {
                debug!("set {name}: kernel content unknown, rebuilding it");
            }
            diffs.push((name, hashed_name, applied.stage(wanted)));
        }

        for name in &deleted {
            batch.push(Some(name.as_str()), on_flush, format!("-F {}", hash::set_name(name)));
        }

        for (name, hashed_name, diff) in diffs {
            let section = Some(name.as_str());
            if diff.flush {
                batch.push(section, batch::fail, format!("-F {hashed_name}"));
            }
            for member in diff.removed {
                batch.push(section, on_member_delete, format!("-D {hashed_name} {member}"));
            }
            for member in diff.added {
                batch.push(section, on_member_add, format!("-A {hashed_name} {member}"));
            }
        }

        for name in &deleted {
            batch.push(Some(name.as_str()), on_destroy, format!("-X {}", hash::set_name(name)));
        }

        Plan {
            batch,
            updated,
            deleted,
        }
    }

    /// Record the outcome of a planned batch: applied sets leave the dirty cache, the others
    /// stay for the next apply.
    pub(super) fn settle(&mut self, updated: &[String], deleted: &[String], outcome: &Outcome) {
        for name in updated {
            if outcome.is_pending(name) {
                if let Some(applied) = self.kernel.get_mut(name) {
                    applied.invalidate();
                }
                continue;
            }
            if let Some(applied) = self.kernel.get_mut(name) {
                applied.commit();
            }
            self.dirty.to_add_or_update.remove(name);
        }

        for name in deleted {
            if outcome.is_pending(name) {
                // the flush may have run before the destroy was refused
                if let Some(applied) = self.kernel.get_mut(name) {
                    applied.invalidate();
                }
                continue;
            }
            self.kernel.remove(name);
            self.dirty.to_delete.remove(name);
        }
    }

    /// Map the outcome to the apply result.
    pub(super) fn outcome_result(outcome: Outcome) -> Result {
        if let Some(e) = outcome.error {
            return Err(Error::Apply(e));
        }
        if !outcome.deferred.is_empty() {
            return Err(Error::InUse(outcome.deferred.into_iter().collect()));
        }
        Ok(())
    }
}

/// Destroy every kernel set carrying our prefix.
pub(super) fn destroy_all(backend: &dyn KernelBackend, max_tries: usize) -> Result {
    let output = backend
        .exec(Tool::IpSet, &["list", "--name"])
        .map_err(|e| Error::Exec(e.to_string()))?;
    if !output.success() {
        return Err(Error::Exec(output.message()));
    }

    let names: Set<&str> = (output.stdout.lines())
        .map(str::trim)
        .filter(|name| name.starts_with(SET_PREFIX))
        .collect();
    if names.is_empty() {
        debug!("no kernel set to destroy");
        return Ok(());
    }
    warn!("destroying {} kernel sets left by a previous run", names.len());

    let mut batch = Batch::new(Tool::IpSet);
    for name in &names {
        batch.push(Some(*name), on_flush, format!("-F {name}"));
    }
    for name in &names {
        batch.push(Some(*name), on_destroy, format!("-X {name}"));
    }

    Cache::outcome_result(batch.run(backend, max_tries))
}
