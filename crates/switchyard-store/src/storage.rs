//! Disk storage
//!
//! ```text
//! <data_dir>/
//!   credentials/<protocol>.json
//!   cursors/<base64url(network id)>.json
//!   descriptors.json
//!   configs/<uuid>.ovpn|.conf
//!   keys/wireguard.key
//!   templates/server.ovpn
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash never leaves a torn document.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use switchyard_core::{
    Credentials, CustomConfigDescriptor, Persistence, ProtocolName, SelectorCursor, StoreError,
};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

const DESCRIPTORS_FILE: &str = "descriptors.json";

/// File-backed persistence rooted at one directory
pub struct DiskStorage {
    base_path: PathBuf,
}

impl DiskStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the data directory
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.base_path).await?;
        info!("Storage initialized at {}", self.base_path.display());
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a caller-supplied relative path inside the data directory
    fn resolve(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let path = Path::new(relative);
        let contained = !relative.is_empty()
            && path
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !contained {
            return Err(StoreError::InvalidPath(relative.to_string()));
        }
        Ok(self.base_path.join(path))
    }

    fn credentials_path(&self, protocol: ProtocolName) -> PathBuf {
        self.base_path
            .join("credentials")
            .join(format!("{}.json", protocol.as_str().to_ascii_lowercase()))
    }

    fn cursor_path(&self, network_id: &str) -> PathBuf {
        self.base_path
            .join("cursors")
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(network_id)))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))?;
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, bytes).await?;
        restrict_permissions(&temp).await?;

        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_optional(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match Self::read_optional(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(path, &bytes).await
    }
}

/// Owner read/write only
#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[async_trait]
impl Persistence for DiskStorage {
    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StoreError> {
        Self::write_json(&self.credentials_path(credentials.protocol()), credentials).await
    }

    async fn load_credentials(&self, protocol: ProtocolName) -> Result<Option<Credentials>, StoreError> {
        Self::read_json(&self.credentials_path(protocol)).await
    }

    async fn remove_credentials(&self, protocol: ProtocolName) -> Result<(), StoreError> {
        Self::remove_optional(&self.credentials_path(protocol)).await
    }

    async fn save_file(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        Self::write_atomic(&self.resolve(path)?, bytes).await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Self::read_optional(&self.resolve(path)?).await
    }

    async fn remove_file(&self, path: &str) -> Result<(), StoreError> {
        Self::remove_optional(&self.resolve(path)?).await
    }

    async fn load_cursor(&self, network_id: &str) -> Result<Option<SelectorCursor>, StoreError> {
        Self::read_json(&self.cursor_path(network_id)).await
    }

    async fn save_cursor(&self, network_id: &str, cursor: &SelectorCursor) -> Result<(), StoreError> {
        Self::write_json(&self.cursor_path(network_id), cursor).await
    }

    async fn load_descriptors(&self) -> Result<Vec<CustomConfigDescriptor>, StoreError> {
        Ok(Self::read_json(&self.base_path.join(DESCRIPTORS_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn save_descriptors(&self, descriptors: &[CustomConfigDescriptor]) -> Result<(), StoreError> {
        Self::write_json(&self.base_path.join(DESCRIPTORS_FILE), descriptors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchyard_core::{ConfigTemplater, ConnectionKind, CustomConfigRepository, PortTable};

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("switchyard-store-{}", Uuid::new_v4())))
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn storage() -> (DiskStorage, TempDir) {
        let dir = TempDir::new();
        let storage = DiskStorage::new(&dir.0);
        storage.init().await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn test_credentials_persist_across_instances() {
        let (storage, dir) = storage().await;
        let credentials = Credentials::OpenVpn {
            username: "user".into(),
            password: "pass".into(),
        };
        storage.save_credentials(&credentials).await.unwrap();

        let reopened = DiskStorage::new(&dir.0);
        let loaded = reopened.load_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert_eq!(loaded, Some(credentials));
        assert!(reopened.load_credentials(ProtocolName::IKEv2).await.unwrap().is_none());

        reopened.remove_credentials(ProtocolName::OpenVpn).await.unwrap();
        reopened.remove_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert!(reopened.load_credentials(ProtocolName::OpenVpn).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (storage, dir) = storage().await;
        storage.save_file("keys/wireguard.key", b"secret").await.unwrap();

        let mode = std::fs::metadata(dir.0.join("keys/wireguard.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_escaping_paths_rejected() {
        let (storage, _dir) = storage().await;

        for path in ["../outside", "/etc/passwd", "configs/../../x", ""] {
            let result = storage.save_file(path, b"x").await;
            assert!(matches!(result, Err(StoreError::InvalidPath(_))), "{path}");
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let (storage, _dir) = storage().await;
        assert!(storage.read_file("configs/nothing.ovpn").await.unwrap().is_none());
        storage.remove_file("configs/nothing.ovpn").await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_keyed_by_network() {
        let (storage, _dir) = storage().await;
        let cursor = SelectorCursor {
            current_index: 2,
            preferred_protocol: Some(ConnectionKind::Tcp),
            ..Default::default()
        };

        storage.save_cursor("Café / 5GHz", &cursor).await.unwrap();

        assert_eq!(storage.load_cursor("Café / 5GHz").await.unwrap(), Some(cursor));
        assert!(storage.load_cursor("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repository_on_disk() {
        let (storage, dir) = storage().await;
        let storage = Arc::new(storage);
        let templater = Arc::new(ConfigTemplater::new(PortTable::default()));
        let repo = CustomConfigRepository::new(storage.clone(), templater);

        let descriptor = repo
            .import("branch.ovpn", b"client\nproto udp\nremote 192.0.2.10 1194\n", None)
            .await
            .unwrap();

        assert!(dir.0.join(descriptor.file_path()).exists());
        assert_eq!(storage.load_descriptors().await.unwrap(), vec![descriptor.clone()]);

        repo.remove(descriptor.id).await.unwrap();
        assert!(!dir.0.join(descriptor.file_path()).exists());
        assert!(storage.load_descriptors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_error() {
        let (storage, dir) = storage().await;
        std::fs::create_dir_all(dir.0.join("credentials")).unwrap();
        std::fs::write(dir.0.join("credentials/ikev2.json"), b"{not json").unwrap();

        let result = storage.load_credentials(ProtocolName::IKEv2).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
