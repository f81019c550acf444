use log::info;
use std::path::Path;

use crate::dataplane::{self, Dataplane};
use crate::ipsets::{SetKind, SetMetadata};
use crate::policies::NetworkPolicy;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("list {list}: member {member} is not a hash set of the document")]
    UnknownMember { list: String, member: String },
    #[error(transparent)]
    Dataplane(#[from] dataplane::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// JSON for `.json` files, YAML otherwise.
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Sets and policies to program, applied through the orchestrator.
///
/// ```yaml
/// sets:
///   - name: default
///     type: namespace
///     members:
///       - ip: 10.0.0.5
///         owner: default/web-0
/// policies:
///   - namespace: default
///     name: deny-all
///     pod_selector_sets: [{ name: default, type: namespace }]
///     pod_selector_list: [{ set: { name: default, type: namespace }, match_type: either }]
///     acls: [{ verdict: drop, direction: ingress }]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct DesiredState {
    #[serde(default)]
    pub sets: Vec<SetSpec>,
    #[serde(default)]
    pub policies: Vec<NetworkPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct SetSpec {
    #[serde(flatten)]
    pub metadata: SetMetadata,
    /// members of a hash set
    #[serde(default)]
    pub members: Vec<MemberSpec>,
    /// names of the document's hash sets in this list
    #[serde(default)]
    pub lists: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MemberSpec {
    pub ip: String,
    #[serde(default)]
    pub owner: String,
}

impl DesiredState {
    pub fn parse(data: &[u8], format: Format) -> Result<Self> {
        Ok(match format {
            Format::Yaml => serde_yaml::from_slice(data)?,
            Format::Json => serde_json::from_slice(data)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&data, Format::of(path))
    }

    /// Bring the dataplane to the document: sets and their members first, then lists, then
    /// policies, and push everything to the kernel.
    pub fn apply(&self, dp: &Dataplane) -> Result {
        let all: Vec<SetMetadata> = self.sets.iter().map(|s| s.metadata.clone()).collect();
        dp.create_sets(&all);

        for set in &self.sets {
            let target = std::slice::from_ref(&set.metadata);
            for member in &set.members {
                dp.add_to_sets(target, &member.ip, &member.owner)?;
            }
        }

        for set in self.sets.iter().filter(|s| !s.lists.is_empty()) {
            let current = (dp.ipsets().get(&set.metadata.prefixed_name()))
                .and_then(|s| s.list_members().cloned())
                .unwrap_or_default();

            let mut members = Vec::with_capacity(set.lists.len());
            for name in &set.lists {
                let member = self.hash_set(name).ok_or_else(|| Error::UnknownMember {
                    list: set.metadata.prefixed_name(),
                    member: name.clone(),
                })?;
                if !current.contains(&member.prefixed_name()) {
                    members.push(member.clone());
                }
            }
            dp.add_to_lists(std::slice::from_ref(&set.metadata), &members)?;
        }

        for policy in &self.policies {
            dp.update_policy(policy)?;
        }

        dp.apply_dataplane()?;
        info!(
            "desired state applied: {} sets, {} policies",
            self.sets.len(),
            self.policies.len()
        );
        Ok(())
    }

    fn hash_set(&self, name: &str) -> Option<&SetMetadata> {
        (self.sets.iter())
            .map(|s| &s.metadata)
            .find(|m| m.name == name && m.kind() == SetKind::Hash)
    }
}
