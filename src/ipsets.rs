use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;

use crate::{batch, hash};

mod applied;
mod apply;
mod cache;
mod manager;

#[cfg(test)]
mod tests;

pub use cache::{Cache, Dirty};
pub use manager::IpSetManager;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("set {0} not found")]
    NotFound(String),
    #[error("set {name} is a {actual} set, expected a {expected} set")]
    WrongKind {
        name: String,
        expected: SetKind,
        actual: SetKind,
    },
    #[error("list set {0} cannot be a list member")]
    NestedList(String),
    #[error("list {0} cannot contain itself")]
    SelfMembership(String),
    #[error("set {member} is already a member of list {list}")]
    AlreadyMember { list: String, member: String },
    #[error("set {member} is not a member of list {list}")]
    NotMember { list: String, member: String },
    #[error("set {0} is still referenced or not empty")]
    NotDeletable(String),
    #[error("invalid member {member:?} for set {set}")]
    InvalidMember { set: String, member: String },
    #[error("apply failed: {0}")]
    Apply(#[from] batch::Error),
    #[error("sets still in use in the kernel: {}", .0.join(", "))]
    InUse(Vec<String>),
    #[error("ipset failed: {0}")]
    Exec(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetKind {
    Hash,
    List,
}
impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hash => "hash",
            Self::List => "list",
        })
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SetType {
    Namespace,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
}

impl SetType {
    pub fn kind(self) -> SetKind {
        use SetType::*;
        match self {
            Namespace | KeyLabelOfPod | KeyValueLabelOfPod | NamedPorts | CidrBlocks => {
                SetKind::Hash
            }
            KeyLabelOfNamespace | KeyValueLabelOfNamespace | NestedLabelOfPod => SetKind::List,
        }
    }

    pub fn prefix(self) -> &'static str {
        use SetType::*;
        match self {
            Namespace => "ns-",
            KeyLabelOfNamespace | KeyValueLabelOfNamespace => "nslabel-",
            KeyLabelOfPod | KeyValueLabelOfPod => "podlabel-",
            NamedPorts => "namedport:",
            NestedLabelOfPod => "nestedlabel-",
            CidrBlocks => "cidr-",
        }
    }

    /// Type and options given to `ipset create`.
    pub fn kernel_spec(self) -> &'static str {
        use SetType::*;
        match self {
            NamedPorts => "hash:ip,port",
            CidrBlocks => "nethash maxelem 4294967295",
            _ if self.kind() == SetKind::List => "setlist",
            _ => "nethash",
        }
    }
}

/// Identity of a set.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize, serde::Serialize,
)]
pub struct SetMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub set_type: SetType,
}

impl SetMetadata {
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
        }
    }

    /// Cache key, e.g. `ns-default`.
    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.set_type.prefix(), self.name)
    }

    pub fn hashed_name(&self) -> String {
        hash::set_name(&self.prefixed_name())
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// policies selecting their pods with this set
    Selector,
    /// policies using this set in their rules
    NetPol,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Members {
    /// member key to owner tag
    Hash(Map<String, String>),
    /// prefixed names of member sets
    List(Set<String>),
}

/// A set and its liveness counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSet {
    pub metadata: SetMetadata,
    pub name: String,
    pub hashed_name: String,
    members: Members,
    selector_refs: Set<String>,
    netpol_refs: Set<String>,
    /// number of lists containing this set
    list_refs: usize,
    /// number of kernel-resident lists containing this set
    kernel_refs: usize,
}

impl IpSet {
    pub fn new(metadata: SetMetadata) -> Self {
        let members = match metadata.kind() {
            SetKind::Hash => Members::Hash(Map::new()),
            SetKind::List => Members::List(Set::new()),
        };
        Self {
            name: metadata.prefixed_name(),
            hashed_name: metadata.hashed_name(),
            metadata,
            members,
            selector_refs: Set::new(),
            netpol_refs: Set::new(),
            list_refs: 0,
            kernel_refs: 0,
        }
    }

    pub fn kind(&self) -> SetKind {
        self.metadata.kind()
    }

    pub fn members(&self) -> &Members {
        &self.members
    }

    pub fn ip_members(&self) -> Option<&Map<String, String>> {
        match &self.members {
            Members::Hash(m) => Some(m),
            Members::List(_) => None,
        }
    }

    pub fn list_members(&self) -> Option<&Set<String>> {
        match &self.members {
            Members::List(m) => Some(m),
            Members::Hash(_) => None,
        }
    }

    pub fn member_count(&self) -> usize {
        match &self.members {
            Members::Hash(m) => m.len(),
            Members::List(m) => m.len(),
        }
    }

    pub fn selector_refs(&self) -> usize {
        self.selector_refs.len()
    }

    pub fn netpol_refs(&self) -> usize {
        self.netpol_refs.len()
    }

    pub fn list_refs(&self) -> usize {
        self.list_refs
    }

    pub fn kernel_refs(&self) -> usize {
        self.kernel_refs
    }

    pub fn is_referenced_by(&self, owner: &str, kind: ReferenceKind) -> bool {
        self.refs(kind).contains(owner)
    }

    fn refs(&self, kind: ReferenceKind) -> &Set<String> {
        match kind {
            ReferenceKind::Selector => &self.selector_refs,
            ReferenceKind::NetPol => &self.netpol_refs,
        }
    }

    fn refs_mut(&mut self, kind: ReferenceKind) -> &mut Set<String> {
        match kind {
            ReferenceKind::Selector => &mut self.selector_refs,
            ReferenceKind::NetPol => &mut self.netpol_refs,
        }
    }

    fn has_policy_refs(&self) -> bool {
        !self.selector_refs.is_empty() || !self.netpol_refs.is_empty()
    }

    /// Whether the set must exist in the kernel.
    pub fn should_be_in_kernel(&self) -> bool {
        self.has_policy_refs() || self.kernel_refs > 0
    }

    pub fn can_be_deleted(&self) -> bool {
        !self.has_policy_refs()
            && self.list_refs == 0
            && self.kernel_refs == 0
            && self.member_count() == 0
    }

    /// Kernel members: IPs (or CIDRs, or `ip,proto:port`) for hash sets, hashed member set
    /// names for lists.
    pub fn kernel_members(&self) -> Set<String> {
        match &self.members {
            Members::Hash(m) => m.keys().cloned().collect(),
            Members::List(m) => m.iter().map(|name| hash::set_name(name)).collect(),
        }
    }
}
