use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use evlog::meta;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::store::PollStore;
use crate::error::StoreError;
use crate::runtime::get_logger;

/// The identity a ballot is recorded under. Exactly one variant applies to a
/// given voter: a server-verified user id for authenticated sessions, or a
/// locally generated device marker for anonymous ones.
///
/// The device marker is a weak identity: it does not stop a determined user
/// from voting again from another device or browser profile. That is an
/// accepted limitation of anonymous voting, not something downstream code
/// should try to compensate for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoterIdentity {
    User(Uuid),
    Device(String),
}

impl VoterIdentity {
    /// Stable string form used by the store's uniqueness constraint.
    pub fn key(&self) -> String {
        match self {
            VoterIdentity::User(id) => format!("user:{}", id),
            VoterIdentity::Device(fingerprint) => format!("device:{}", fingerprint),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if let Some(id) = key.strip_prefix("user:") {
            return id.parse::<Uuid>().ok().map(VoterIdentity::User);
        }
        key.strip_prefix("device:").map(|f| VoterIdentity::Device(f.to_owned()))
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, VoterIdentity::Device(_))
    }
}

/// Source of the authenticated session, if any.
pub trait IdentityProvider: Send + Sync {
    fn authenticated_user(&self) -> Option<Uuid>;
}

/// Fixed identity provider for embedders that manage sessions elsewhere.
pub struct StaticIdentity(pub Option<Uuid>);

impl IdentityProvider for StaticIdentity {
    fn authenticated_user(&self) -> Option<Uuid> {
        self.0
    }
}

/// Durable client-side storage for anonymous participation markers.
///
/// `set_marker` records the selections made at submission time so a later
/// page load can answer "has this device already voted?" without any network
/// round trip.
pub trait MarkerStore: Send + Sync {
    /// Stable fingerprint for this device; generated once and persisted.
    fn device_id(&self) -> String;

    fn get_marker(&self, poll_id: Uuid) -> Option<Vec<usize>>;

    fn set_marker(&self, poll_id: Uuid, selections: &[usize]);
}

#[derive(Serialize, Deserialize)]
struct MarkerFile {
    device_id: String,
    markers: HashMap<Uuid, Vec<usize>>,
}

/// JSON-file-backed `MarkerStore`, the desktop analogue of the browser's
/// local storage.
pub struct FileMarkerStore {
    path: PathBuf,
    device_id: String,
    markers: DashMap<Uuid, Vec<usize>>,
    write_lock: Mutex<()>,
}

impl FileMarkerStore {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: MarkerFile = serde_json::from_str(&raw)?;

            let markers = DashMap::new();
            for (poll_id, selections) in file.markers {
                markers.insert(poll_id, selections);
            }

            return Ok(Self {
                path,
                device_id: file.device_id,
                markers,
                write_lock: Mutex::new(()),
            });
        }

        let store = Self {
            path,
            device_id: generate_device_id(),
            markers: DashMap::new(),
            write_lock: Mutex::new(()),
        };
        store.persist()?;

        Ok(store)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        let file = MarkerFile {
            device_id: self.device_id.clone(),
            markers: self
                .markers
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;

        Ok(())
    }
}

impl MarkerStore for FileMarkerStore {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn get_marker(&self, poll_id: Uuid) -> Option<Vec<usize>> {
        self.markers.get(&poll_id).map(|e| e.value().clone())
    }

    fn set_marker(&self, poll_id: Uuid, selections: &[usize]) {
        self.markers.insert(poll_id, selections.to_vec());

        match self.persist() {
            Ok(()) => {}
            Err(e) => {
                get_logger().error("Failed to persist vote marker file.", meta! {
                    "PollID" => poll_id,
                    "Error" => e,
                });
            }
        }
    }
}

/// In-memory `MarkerStore` for tests and short-lived embedders.
pub struct MemoryMarkerStore {
    device_id: String,
    markers: DashMap<Uuid, Vec<usize>>,
}

impl Default for MemoryMarkerStore {
    fn default() -> Self {
        Self {
            device_id: generate_device_id(),
            markers: DashMap::new(),
        }
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn get_marker(&self, poll_id: Uuid) -> Option<Vec<usize>> {
        self.markers.get(&poll_id).map(|e| e.value().clone())
    }

    fn set_marker(&self, poll_id: Uuid, selections: &[usize]) {
        self.markers.insert(poll_id, selections.to_vec());
    }
}

fn generate_device_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Resolves the voting identity for the current session and answers the
/// "has this identity already voted?" predicate from the cheapest
/// authoritative source.
pub struct VoterResolver<S> {
    store: Arc<S>,
    provider: Arc<dyn IdentityProvider>,
    markers: Arc<dyn MarkerStore>,
}

impl<S: PollStore> VoterResolver<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn IdentityProvider>, markers: Arc<dyn MarkerStore>) -> Self {
        Self { store, provider, markers }
    }

    pub fn resolve(&self) -> VoterIdentity {
        match self.provider.authenticated_user() {
            Some(id) => VoterIdentity::User(id),
            None => VoterIdentity::Device(self.markers.device_id()),
        }
    }

    /// Authenticated identities are checked against the store; anonymous ones
    /// read only the local marker, so this works offline after a reload.
    pub async fn has_voted(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let identity = self.resolve();

        match &identity {
            VoterIdentity::User(_) => {
                let existing = self.store.find_ballot(poll_id, &identity).await?;
                Ok(existing.is_some())
            }
            VoterIdentity::Device(_) => Ok(self.markers.get_marker(poll_id).is_some()),
        }
    }

    pub async fn prior_selection(&self, poll_id: Uuid) -> Result<Option<Vec<usize>>, StoreError> {
        let identity = self.resolve();

        match &identity {
            VoterIdentity::User(_) => {
                let existing = self.store.find_ballot(poll_id, &identity).await?;
                Ok(existing.map(|b| b.selections))
            }
            VoterIdentity::Device(_) => Ok(self.markers.get_marker(poll_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voter_key_roundtrip() {
        let user = VoterIdentity::User(Uuid::new_v4());
        assert_eq!(VoterIdentity::from_key(&user.key()), Some(user.clone()));
        assert!(!user.is_anonymous());

        let device = VoterIdentity::Device("a1b2c3d4e5f60718".to_owned());
        assert_eq!(VoterIdentity::from_key(&device.key()), Some(device.clone()));
        assert!(device.is_anonymous());

        assert_eq!(VoterIdentity::from_key("unknown:xyz"), None);
        assert_eq!(VoterIdentity::from_key("user:not-a-uuid"), None);
    }

    #[test]
    fn device_id_is_16_hex_chars() {
        let id = generate_device_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_marker_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        let poll_id = Uuid::new_v4();

        let store = FileMarkerStore::open(path.clone()).unwrap();
        let device_id = store.device_id();
        store.set_marker(poll_id, &[0, 2]);
        drop(store);

        let reopened = FileMarkerStore::open(path).unwrap();
        assert_eq!(reopened.device_id(), device_id);
        assert_eq!(reopened.get_marker(poll_id), Some(vec![0, 2]));
        assert_eq!(reopened.get_marker(Uuid::new_v4()), None);
    }
}
