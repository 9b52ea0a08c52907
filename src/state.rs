use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{domain::AccessRequest, domain::DomainError, tally::ConsensusTransaction};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl StoreError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

/// An access request together with the consensus transaction that gates it, if any.
/// Both live and are archived as one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub request: AccessRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<ConsensusTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub records: BTreeMap<String, RequestRecord>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            records: BTreeMap::new(),
        }
    }
}

pub struct JsonSnapshotStore {
    state_path: PathBuf,
    state: PersistedState,
}

impl JsonSnapshotStore {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let state_path = data_dir.join("state.json");
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let store = Self { state_path, state };
        if is_new_state {
            store.save()?;
        }
        Ok(store)
    }

    pub fn get_record(&self, request_id: &str) -> Option<RequestRecord> {
        self.state.records.get(request_id).cloned()
    }

    pub fn list_records(&self) -> Vec<RequestRecord> {
        self.state.records.values().cloned().collect()
    }

    /// Inserts or replaces a record and writes the snapshot. On a failed write the
    /// in-memory snapshot is rolled back so it never runs ahead of disk.
    pub fn put_record(&mut self, record: RequestRecord) -> Result<(), StoreError> {
        let request_id = record.request.request_id.clone();
        let previous = self.state.records.insert(request_id.clone(), record);
        if let Err(err) = self.save() {
            match previous {
                Some(previous) => {
                    self.state.records.insert(request_id, previous);
                }
                None => {
                    self.state.records.remove(&request_id);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        domain::{AccessScope, ApprovalFlavor, DocumentKind, Party},
        id::{is_ulid_string, new_request_id},
    };

    fn record(request_id: String) -> RequestRecord {
        RequestRecord {
            request: AccessRequest::new(
                request_id,
                Party {
                    id: "doc-1".to_string(),
                    name: "Dr. Rao".to_string(),
                },
                Party {
                    id: "pat-1".to_string(),
                    name: "Mira".to_string(),
                },
                "referral".to_string(),
                BTreeSet::from([DocumentKind::Prescriptions]),
                AccessScope::View,
                ApprovalFlavor::OwnerApproval,
                Utc::now(),
            ),
            transaction: None,
        }
    }

    #[test]
    fn bootstrap_creates_empty_state_json() {
        let tmp = tempfile::tempdir().unwrap();

        let _store = JsonSnapshotStore::load_or_init(tmp.path()).unwrap();
        let state_path = tmp.path().join("state.json");
        assert!(state_path.exists());

        let bytes = fs::read(&state_path).unwrap();
        let state: PersistedState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert!(state.records.is_empty());
    }

    #[test]
    fn save_load_roundtrip_persists_records() {
        let tmp = tempfile::tempdir().unwrap();
        let request_id = new_request_id();
        assert!(is_ulid_string(&request_id));

        let mut store = JsonSnapshotStore::load_or_init(tmp.path()).unwrap();
        store.put_record(record(request_id.clone())).unwrap();
        drop(store);

        let store = JsonSnapshotStore::load_or_init(tmp.path()).unwrap();
        let loaded = store.get_record(&request_id).unwrap();
        assert_eq!(loaded.request.reason, "referral");
        assert_eq!(store.list_records().len(), 1);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("state.json"),
            br#"{"schema_version": 99, "records": {}}"#,
        )
        .unwrap();

        match JsonSnapshotStore::load_or_init(tmp.path()) {
            Err(StoreError::SchemaVersionMismatch { expected, got }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(got, 99);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected schema mismatch"),
        }
    }

    #[test]
    fn failed_write_rolls_back_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let mut store = JsonSnapshotStore::load_or_init(&data_dir).unwrap();
        fs::remove_dir_all(&data_dir).unwrap();

        let request_id = new_request_id();
        let err = store.put_record(record(request_id.clone())).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.get_record(&request_id).is_none());
    }
}
