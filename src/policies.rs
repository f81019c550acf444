use crate::hash;
use crate::ipsets::SetMetadata;

mod chains;
mod manager;
pub mod rules;


pub use chains::{JumpPosition, JumpState};
pub use manager::PolicyManager;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("apply failed: {0}")]
    Apply(#[from] crate::batch::Error),
    #[error("iptables {args} failed: {message}")]
    Exec { args: String, message: String },
}

/// A policy as produced by the translation of a Kubernetes NetworkPolicy.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct NetworkPolicy {
    pub namespace: String,
    pub name: String,
    /// sets to create and reference for the pod selector
    #[serde(default)]
    pub pod_selector_sets: Vec<TranslatedSet>,
    /// matches selecting the pods the policy applies to
    #[serde(default)]
    pub pod_selector_list: Vec<SetInfo>,
    /// sets to create and reference for the rules' peers
    #[serde(default)]
    pub rule_sets: Vec<TranslatedSet>,
    /// evaluated in order, first match wins
    #[serde(default)]
    pub acls: Vec<Acl>,
}

/// A set needed by a policy, with the members the policy itself defines (CIDRs for CIDR
/// sets, member set names for nested lists).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct TranslatedSet {
    #[serde(flatten)]
    pub metadata: SetMetadata,
    #[serde(default)]
    pub members: Vec<String>,
}

impl TranslatedSet {
    pub fn new(metadata: SetMetadata) -> Self {
        Self {
            metadata,
            members: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct SetInfo {
    pub set: SetMetadata,
    #[serde(default = "default_included")]
    pub included: bool,
    pub match_type: MatchType,
}
fn default_included() -> bool {
    true
}

impl SetInfo {
    pub fn new(set: SetMetadata, included: bool, match_type: MatchType) -> Self {
        Self {
            set,
            included,
            match_type,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Src,
    Dst,
    /// destination address and port, for named ports
    Both,
    /// the policy's pods: destination on ingress, source on egress
    Either,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

impl Direction {
    pub fn has_ingress(self) -> bool {
        matches!(self, Self::Ingress | Self::Both)
    }

    pub fn has_egress(self) -> bool {
        matches!(self, Self::Egress | Self::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Drop,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    #[default]
    Unspecified,
}

/// Port range; a single port when `end_port` is 0 or equal to `port`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Ports {
    pub port: u16,
    #[serde(default)]
    pub end_port: u16,
}

impl Ports {
    pub fn single(port: u16) -> Self {
        Self { port, end_port: 0 }
    }

    pub fn range(port: u16, end_port: u16) -> Self {
        Self { port, end_port }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Acl {
    #[serde(default)]
    pub src_list: Vec<SetInfo>,
    #[serde(default)]
    pub dst_list: Vec<SetInfo>,
    #[serde(default)]
    pub src_ports: Option<Ports>,
    #[serde(default)]
    pub dst_ports: Option<Ports>,
    #[serde(default)]
    pub protocol: Protocol,
    pub verdict: Verdict,
    pub direction: Direction,
}

impl Acl {
    pub fn new(verdict: Verdict, direction: Direction) -> Self {
        Self {
            src_list: Vec::new(),
            dst_list: Vec::new(),
            src_ports: None,
            dst_ports: None,
            protocol: Protocol::Unspecified,
            verdict,
            direction,
        }
    }
}

impl NetworkPolicy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            pod_selector_sets: Vec::new(),
            pod_selector_list: Vec::new(),
            rule_sets: Vec::new(),
            acls: Vec::new(),
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn ingress_chain(&self) -> String {
        chain_name(rules::INGRESS_CHAIN, &self.key())
    }

    pub fn egress_chain(&self) -> String {
        chain_name(rules::EGRESS_CHAIN, &self.key())
    }

    pub fn has_ingress(&self) -> bool {
        self.acls.iter().any(|acl| acl.direction.has_ingress())
    }

    pub fn has_egress(&self) -> bool {
        self.acls.iter().any(|acl| acl.direction.has_egress())
    }

    /// The same policy with every order-insensitive list sorted. ACL order is kept: it is
    /// the evaluation order.
    pub fn normalized(&self) -> Self {
        let mut policy = self.clone();
        for set in policy
            .pod_selector_sets
            .iter_mut()
            .chain(policy.rule_sets.iter_mut())
        {
            set.members.sort();
            set.members.dedup();
        }
        policy.pod_selector_sets.sort();
        policy.pod_selector_list.sort();
        policy.rule_sets.sort();
        for acl in &mut policy.acls {
            acl.src_list.sort();
            acl.dst_list.sort();
        }
        policy
    }

    /// Whether both policies program the same kernel state.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

fn chain_name(prefix: &str, key: &str) -> String {
    format!("{prefix}-{}", hash::hash(key))
}
