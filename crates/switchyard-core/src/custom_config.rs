//! Imported (custom) configs
//!
//! Each accepted import owns exactly one file, `configs/<id>.<ext>`, and
//! one descriptor record. Both are written together or not at all.
//! Credentials entered for a config live beside it in `configs/<id>.auth`.

use crate::persistence::{Persistence, StoreError};
use crate::protocol::{Candidate, ProtocolError, ProtocolName, Transport};
use crate::remote::UserPass;
use crate::template::{ConfigFormat, ConfigTemplater, TemplateError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Metadata for an imported config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConfigDescriptor {
    pub id: Uuid,
    pub name: String,
    pub server_address: String,
    pub protocol_type: ProtocolName,
    pub port: String,
    pub auth_required: bool,
    pub transport: Transport,
}

impl CustomConfigDescriptor {
    pub fn new(server_address: &str, candidate: &Candidate, auth_required: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: server_address.to_string(),
            server_address: server_address.to_string(),
            protocol_type: candidate.protocol(),
            port: candidate.port().to_string(),
            auth_required,
            transport: candidate.transport(),
        }
    }

    pub fn candidate(&self) -> Result<Candidate, ProtocolError> {
        Candidate::from_parts(self.protocol_type, self.transport, self.port.as_str())
    }

    pub fn file_name(&self) -> String {
        let extension = ConfigFormat::for_protocol(self.protocol_type).extension();
        format!("{}.{}", self.id, extension)
    }

    /// Relative storage path of the backing file
    pub fn file_path(&self) -> String {
        format!("configs/{}", self.file_name())
    }

    /// Relative storage path of the saved username/password
    pub fn credentials_path(&self) -> String {
        format!("configs/{}.auth", self.id)
    }
}

/// Custom config errors
#[derive(Debug, thiserror::Error)]
pub enum CustomConfigError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("No custom config with id {0}")]
    NotFound(Uuid),

    #[error("Config file for {0} is missing")]
    MissingFile(Uuid),

    #[error("Config name is empty")]
    EmptyName,

    #[error("Custom config credentials have an empty {0}")]
    EmptyCredential(&'static str),
}

/// Protocol implied by a file extension
pub fn protocol_from_extension(file_name: &str) -> Option<ProtocolName> {
    let extension = Path::new(file_name).extension()?.to_str()?;
    match extension.to_ascii_lowercase().as_str() {
        "ovpn" => Some(ProtocolName::OpenVpn),
        "conf" => Some(ProtocolName::WireGuard),
        _ => None,
    }
}

/// Stores, lists and removes imported configs
pub struct CustomConfigRepository {
    persistence: Arc<dyn Persistence>,
    templater: Arc<ConfigTemplater>,
    /// Serializes descriptor list read-modify-write cycles
    write_lock: Mutex<()>,
}

impl CustomConfigRepository {
    pub fn new(persistence: Arc<dyn Persistence>, templater: Arc<ConfigTemplater>) -> Self {
        Self {
            persistence,
            templater,
            write_lock: Mutex::new(()),
        }
    }

    /// Validate, repair and persist an imported file
    pub async fn import(
        &self,
        file_name: &str,
        bytes: &[u8],
        protocol_guess: Option<ProtocolName>,
    ) -> Result<CustomConfigDescriptor, CustomConfigError> {
        let guess = protocol_guess.or_else(|| protocol_from_extension(file_name));
        let parsed = self.templater.parse_imported_config(bytes, guess)?;

        let mut descriptor = parsed.descriptor;
        if let Some(stem) = Path::new(file_name).file_stem().and_then(|s| s.to_str()) {
            if !stem.trim().is_empty() {
                descriptor.name = stem.trim().to_string();
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut descriptors = self.persistence.load_descriptors().await?;

        self.persistence
            .save_file(&descriptor.file_path(), parsed.text.as_bytes())
            .await?;

        descriptors.push(descriptor.clone());
        if let Err(e) = self.persistence.save_descriptors(&descriptors).await {
            // Roll back the file so nothing is left half-imported.
            if let Err(cleanup) = self.persistence.remove_file(&descriptor.file_path()).await {
                warn!("Failed to remove orphaned config file: {}", cleanup);
            }
            return Err(e.into());
        }

        info!(
            "Imported {} config '{}' ({}:{})",
            descriptor.protocol_type, descriptor.name, descriptor.server_address, descriptor.port
        );
        Ok(descriptor)
    }

    pub async fn list(&self) -> Result<Vec<CustomConfigDescriptor>, CustomConfigError> {
        Ok(self.persistence.load_descriptors().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<CustomConfigDescriptor, CustomConfigError> {
        self.list()
            .await?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or(CustomConfigError::NotFound(id))
    }

    /// Contents of the file backing `descriptor`
    pub async fn load_file(&self, descriptor: &CustomConfigDescriptor) -> Result<String, CustomConfigError> {
        let bytes = self
            .persistence
            .read_file(&descriptor.file_path())
            .await?
            .ok_or(CustomConfigError::MissingFile(descriptor.id))?;

        String::from_utf8(bytes).map_err(|_| {
            CustomConfigError::Template(TemplateError::InvalidConfigData("stored config is not UTF-8".into()))
        })
    }

    /// Change the display name of a config
    pub async fn rename(&self, id: Uuid, name: &str) -> Result<CustomConfigDescriptor, CustomConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CustomConfigError::EmptyName);
        }

        let _guard = self.write_lock.lock().await;
        let mut descriptors = self.persistence.load_descriptors().await?;
        let descriptor = descriptors
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(CustomConfigError::NotFound(id))?;

        let previous = std::mem::replace(&mut descriptor.name, name.to_string());
        let renamed = descriptor.clone();
        self.persistence.save_descriptors(&descriptors).await?;

        info!("Renamed custom config '{}' to '{}'", previous, renamed.name);
        Ok(renamed)
    }

    /// Save the username/password used when connecting to `id`
    pub async fn update_credentials(&self, id: Uuid, credentials: &UserPass) -> Result<(), CustomConfigError> {
        if credentials.username.trim().is_empty() {
            return Err(CustomConfigError::EmptyCredential("username"));
        }
        if credentials.password.is_empty() {
            return Err(CustomConfigError::EmptyCredential("password"));
        }

        let _guard = self.write_lock.lock().await;
        let descriptor = self
            .persistence
            .load_descriptors()
            .await?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or(CustomConfigError::NotFound(id))?;

        let bytes = serde_json::to_vec(credentials).map_err(StoreError::from)?;
        self.persistence.save_file(&descriptor.credentials_path(), &bytes).await?;

        info!("Updated credentials for custom config '{}'", descriptor.name);
        Ok(())
    }

    /// Credentials saved for `descriptor`, if any
    pub async fn stored_credentials(
        &self,
        descriptor: &CustomConfigDescriptor,
    ) -> Result<Option<UserPass>, CustomConfigError> {
        let Some(bytes) = self.persistence.read_file(&descriptor.credentials_path()).await? else {
            return Ok(None);
        };
        let credentials = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        Ok(Some(credentials))
    }

    /// Remove the descriptor, its file and any saved credentials.
    ///
    /// The descriptor list is written first; a file left behind by a later
    /// failure is unreachable and only logged.
    pub async fn remove(&self, id: Uuid) -> Result<(), CustomConfigError> {
        let _guard = self.write_lock.lock().await;
        let mut descriptors = self.persistence.load_descriptors().await?;

        let position = descriptors
            .iter()
            .position(|d| d.id == id)
            .ok_or(CustomConfigError::NotFound(id))?;
        let descriptor = descriptors.remove(position);

        self.persistence.save_descriptors(&descriptors).await?;

        for path in [descriptor.file_path(), descriptor.credentials_path()] {
            if let Err(e) = self.persistence.remove_file(&path).await {
                warn!("Failed to remove orphaned {}: {}", path, e);
            }
        }

        info!("Removed custom config '{}'", descriptor.name);
        Ok(())
    }
}
