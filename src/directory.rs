use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{DomainError, Identity, Party, Role},
    state::StoreError,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    pub role: Role,
    /// Identities allowed to grant or deny on this entry's behalf.
    #[serde(default)]
    pub delegates: BTreeSet<String>,
}

/// Identity and patient directory lookups consumed by the consent workflow.
pub trait Directory: Send + Sync {
    fn lookup(&self, id: &str) -> Option<&DirectoryEntry>;

    fn resolve_target(&self, id: &str) -> Result<Party, DomainError> {
        self.lookup(id)
            .map(|e| Party {
                id: e.id.clone(),
                name: e.name.clone(),
            })
            .ok_or_else(|| DomainError::TargetNotFound {
                target_id: id.to_string(),
            })
    }

    fn resolve_identity(&self, id: &str) -> Option<Identity> {
        self.lookup(id).map(|e| Identity {
            id: e.id.clone(),
            name: e.name.clone(),
            role: e.role,
        })
    }

    fn may_decide_for(&self, owner_id: &str, actor_id: &str) -> bool {
        owner_id == actor_id
            || self
                .lookup(owner_id)
                .is_some_and(|e| e.delegates.contains(actor_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: BTreeMap<String, DirectoryEntry>,
}

impl StaticDirectory {
    pub fn from_entries(entries: Vec<DirectoryEntry>) -> Result<Self, DomainError> {
        let mut out = BTreeMap::new();
        for entry in entries {
            if entry.id.trim().is_empty() {
                return Err(DomainError::ConfigurationError {
                    reason: "directory entry id is empty".to_string(),
                });
            }
            if out.contains_key(&entry.id) {
                return Err(DomainError::ConfigurationError {
                    reason: format!("duplicate directory entry: {}", entry.id),
                });
            }
            out.insert(entry.id.clone(), entry);
        }
        Ok(Self { entries: out })
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = fs::read(path)?;
        let entries: Vec<DirectoryEntry> = serde_json::from_slice(&bytes)?;
        Ok(Self::from_entries(entries)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, id: &str) -> Option<&DirectoryEntry> {
        self.entries.get(id)
    }
}
