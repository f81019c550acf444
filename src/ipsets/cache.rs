use ipnet::IpNet;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::net::IpAddr;

use super::applied::Applied;
use super::{Error, IpSet, Members, ReferenceKind, Result, SetKind, SetMetadata, SetType};

/// Names of sets with pending kernel changes. A name is in at most one of the two sets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dirty {
    pub to_add_or_update: Set<String>,
    pub to_delete: Set<String>,
}

impl Dirty {
    fn add_or_update(&mut self, name: &str) {
        self.to_delete.remove(name);
        self.to_add_or_update.insert(name.to_string());
    }

    fn delete(&mut self, name: &str) {
        self.to_add_or_update.remove(name);
        self.to_delete.insert(name.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.to_add_or_update.is_empty() && self.to_delete.is_empty()
    }
}

/// In-memory set cache. No kernel call happens here.
#[derive(Debug, Default)]
pub struct Cache {
    pub(super) sets: Map<String, IpSet>,
    pub(super) dirty: Dirty,
    /// sets known to exist in the kernel
    pub(super) kernel: Map<String, Applied>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&IpSet> {
        self.sets.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn dirty(&self) -> &Dirty {
        &self.dirty
    }

    pub fn kernel_len(&self) -> usize {
        self.sets.values().filter(|s| s.should_be_in_kernel()).count()
    }

    pub fn create_set(&mut self, metadata: &SetMetadata) {
        let name = metadata.prefixed_name();
        if let Some(set) = self.sets.get(&name) {
            if set.metadata.set_type != metadata.set_type {
                error!(
                    "set {name} exists as {:?}, not creating it as {:?}",
                    set.metadata.set_type, metadata.set_type
                );
            }
            return;
        }
        debug!("creating set {name}");
        self.sets.insert(name, IpSet::new(metadata.clone()));
    }

    /// Delete the set if nothing uses it anymore.
    pub fn delete_set(&mut self, name: &str) -> Result {
        let Some(set) = self.sets.get(name) else {
            return Ok(());
        };
        if !set.can_be_deleted() {
            return Err(Error::NotDeletable(name.to_string()));
        }
        debug!("deleting set {name}");
        self.sets.remove(name);
        Ok(())
    }

    fn hash_set(&self, name: &str) -> Result<&IpSet> {
        let set = self.set(name)?;
        match set.kind() {
            SetKind::Hash => Ok(set),
            actual => Err(Error::WrongKind {
                name: name.to_string(),
                expected: SetKind::Hash,
                actual,
            }),
        }
    }

    fn list_set(&self, name: &str) -> Result<&IpSet> {
        let set = self.set(name)?;
        match set.kind() {
            SetKind::List => Ok(set),
            actual => Err(Error::WrongKind {
                name: name.to_string(),
                expected: SetKind::List,
                actual,
            }),
        }
    }

    fn set(&self, name: &str) -> Result<&IpSet> {
        self.sets
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Add `member` to every given hash set, owned by `owner`.
    pub fn add_member(&mut self, names: &[String], member: &str, owner: &str) -> Result {
        for name in names {
            let set = self.hash_set(name)?;
            if !valid_member(set.metadata.set_type, member) {
                return Err(Error::InvalidMember {
                    set: name.clone(),
                    member: member.to_string(),
                });
            }
        }

        for name in names {
            let Some(set) = self.sets.get_mut(name) else {
                continue;
            };
            let Members::Hash(members) = &mut set.members else {
                continue;
            };
            match members.insert(member.to_string(), owner.to_string()) {
                Some(prev) if prev == owner => continue,
                Some(prev) => {
                    warn!("set {name}: member {member} moves from {prev} to {owner}");
                    continue;
                }
                None => {}
            }
            if set.should_be_in_kernel() {
                self.dirty.add_or_update(name);
            }
        }
        Ok(())
    }

    /// Remove `member` from every given hash set, unless it is owned by someone else.
    pub fn remove_member(&mut self, names: &[String], member: &str, owner: &str) -> Result {
        for name in names {
            self.hash_set(name)?;
        }

        for name in names {
            let Some(set) = self.sets.get_mut(name) else {
                continue;
            };
            let Members::Hash(members) = &mut set.members else {
                continue;
            };
            match members.get(member) {
                None => continue,
                Some(current) if current != owner => {
                    info!(
                        "set {name}: ignoring stale removal of {member} by {owner}, owned by {current}"
                    );
                    continue;
                }
                Some(_) => {}
            }
            members.remove(member);
            if set.should_be_in_kernel() {
                self.dirty.add_or_update(name);
            }
        }
        Ok(())
    }

    pub fn add_to_list(&mut self, list: &str, members: &[String]) -> Result {
        let list_set = self.list_set(list)?;
        let mut seen = Set::new();
        for member in members {
            self.check_list_member(list, member)?;
            let present = list_set.list_members().is_some_and(|m| m.contains(member));
            if present || !seen.insert(member) {
                return Err(Error::AlreadyMember {
                    list: list.to_string(),
                    member: member.clone(),
                });
            }
        }
        if members.is_empty() {
            return Ok(());
        }

        let in_kernel = list_set.should_be_in_kernel();
        if let Some(set) = self.sets.get_mut(list)
            && let Members::List(current) = &mut set.members
        {
            current.extend(members.iter().cloned());
        }
        for member in members {
            if let Some(set) = self.sets.get_mut(member) {
                set.list_refs += 1;
            }
            if in_kernel {
                self.increment_kernel_refs(member);
            }
        }
        if in_kernel {
            self.dirty.add_or_update(list);
        }
        Ok(())
    }

    pub fn remove_from_list(&mut self, list: &str, members: &[String]) -> Result {
        let list_set = self.list_set(list)?;
        let mut seen = Set::new();
        for member in members {
            self.check_list_member(list, member)?;
            let present = list_set.list_members().is_some_and(|m| m.contains(member));
            if !present || !seen.insert(member) {
                return Err(Error::NotMember {
                    list: list.to_string(),
                    member: member.clone(),
                });
            }
        }
        if members.is_empty() {
            return Ok(());
        }

        let in_kernel = list_set.should_be_in_kernel();
        if let Some(set) = self.sets.get_mut(list)
            && let Members::List(current) = &mut set.members
        {
            for member in members {
                current.remove(member);
            }
        }
        for member in members {
            if let Some(set) = self.sets.get_mut(member) {
                set.list_refs = set.list_refs.saturating_sub(1);
            }
            if in_kernel {
                self.decrement_kernel_refs(member);
            }
        }
        if in_kernel {
            self.dirty.add_or_update(list);
        }
        Ok(())
    }

    fn check_list_member(&self, list: &str, member: &str) -> Result {
        if list == member {
            return Err(Error::SelfMembership(list.to_string()));
        }
        match self.set(member)?.kind() {
            SetKind::Hash => Ok(()),
            SetKind::List => Err(Error::NestedList(member.to_string())),
        }
    }

    pub fn add_reference(&mut self, name: &str, owner: &str, kind: ReferenceKind) -> Result {
        let set = self
            .sets
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let was_in_kernel = set.should_be_in_kernel();
        set.refs_mut(kind).insert(owner.to_string());

        if !was_in_kernel {
            self.admit(name);
        }
        Ok(())
    }

    pub fn delete_reference(&mut self, name: &str, owner: &str, kind: ReferenceKind) -> Result {
        let set = self
            .sets
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let was_in_kernel = set.should_be_in_kernel();
        if !set.refs_mut(kind).remove(owner) {
            return Ok(());
        }

        if was_in_kernel && !set.should_be_in_kernel() {
            self.evict(name);
        }
        Ok(())
    }

    /// The set entered the kernel; so do its list members.
    fn admit(&mut self, name: &str) {
        debug!("set {name} enters the kernel");
        self.dirty.add_or_update(name);

        let members = self.list_members_of(name);
        for member in &members {
            self.increment_kernel_refs(member);
        }
    }

    /// The set left the kernel; its list members may follow.
    fn evict(&mut self, name: &str) {
        debug!("set {name} leaves the kernel");
        self.dirty_delete(name);

        let members = self.list_members_of(name);
        for member in &members {
            self.decrement_kernel_refs(member);
        }
    }

    fn list_members_of(&self, name: &str) -> Vec<String> {
        (self.sets.get(name))
            .and_then(|s| s.list_members())
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn increment_kernel_refs(&mut self, name: &str) {
        let Some(set) = self.sets.get_mut(name) else {
            return;
        };
        let was_in_kernel = set.should_be_in_kernel();
        set.kernel_refs += 1;
        if !was_in_kernel {
            debug!("set {name} enters the kernel as a list member");
            self.dirty.add_or_update(name);
        }
    }

    fn decrement_kernel_refs(&mut self, name: &str) {
        let Some(set) = self.sets.get_mut(name) else {
            return;
        };
        set.kernel_refs = set.kernel_refs.saturating_sub(1);
        if !set.should_be_in_kernel() {
            debug!("set {name} leaves the kernel as a list member");
            self.dirty_delete(name);
        }
    }

    /// Enroll a set for destruction, unless it never reached the kernel.
    fn dirty_delete(&mut self, name: &str) {
        if self.kernel.contains_key(name) {
            self.dirty.delete(name);
        } else {
            self.dirty.to_add_or_update.remove(name);
        }
    }
}

/// Whether `member` is acceptable in a hash set of the given type.
fn valid_member(set_type: SetType, member: &str) -> bool {
    let addr = match set_type {
        // ip,proto:port
        SetType::NamedPorts => member.split_once(',').map(|(ip, _)| ip),
        SetType::CidrBlocks => Some(member.strip_suffix(" nomatch").unwrap_or(member)),
        _ => Some(member),
    };
    addr.is_some_and(|addr| addr.parse::<IpAddr>().is_ok() || addr.parse::<IpNet>().is_ok())
}
