//! Local persistence seam
//!
//! Everything the core keeps across restarts goes through [`Persistence`]:
//! cached credentials, selector cursors, imported config descriptors and
//! the files they own. [`MemoryPersistence`] backs tests and ephemeral use.

use crate::credentials::Credentials;
use crate::custom_config::CustomConfigDescriptor;
use crate::protocol::ProtocolName;
use crate::selector::SelectorCursor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Key-value and file store used by the core
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StoreError>;

    async fn load_credentials(&self, protocol: ProtocolName) -> Result<Option<Credentials>, StoreError>;

    async fn remove_credentials(&self, protocol: ProtocolName) -> Result<(), StoreError>;

    /// Write `bytes` at a relative `path`, replacing any previous content
    async fn save_file(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a file. Missing files are not an error.
    async fn remove_file(&self, path: &str) -> Result<(), StoreError>;

    async fn load_cursor(&self, network_id: &str) -> Result<Option<SelectorCursor>, StoreError>;

    async fn save_cursor(&self, network_id: &str, cursor: &SelectorCursor) -> Result<(), StoreError>;

    async fn load_descriptors(&self) -> Result<Vec<CustomConfigDescriptor>, StoreError>;

    async fn save_descriptors(&self, descriptors: &[CustomConfigDescriptor]) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    credentials: HashMap<ProtocolName, Credentials>,
    files: HashMap<String, Vec<u8>>,
    cursors: HashMap<String, SelectorCursor>,
    descriptors: Vec<CustomConfigDescriptor>,
}

/// In-process [`Persistence`]; contents are lost on drop
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.with_state(|s| s.files.len())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.credentials.insert(credentials.protocol(), credentials.clone());
        });
        Ok(())
    }

    async fn load_credentials(&self, protocol: ProtocolName) -> Result<Option<Credentials>, StoreError> {
        Ok(self.with_state(|s| s.credentials.get(&protocol).cloned()))
    }

    async fn remove_credentials(&self, protocol: ProtocolName) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.credentials.remove(&protocol);
        });
        Ok(())
    }

    async fn save_file(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.files.insert(path.to_string(), bytes.to_vec());
        });
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.with_state(|s| s.files.get(path).cloned()))
    }

    async fn remove_file(&self, path: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.files.remove(path);
        });
        Ok(())
    }

    async fn load_cursor(&self, network_id: &str) -> Result<Option<SelectorCursor>, StoreError> {
        Ok(self.with_state(|s| s.cursors.get(network_id).cloned()))
    }

    async fn save_cursor(&self, network_id: &str, cursor: &SelectorCursor) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.cursors.insert(network_id.to_string(), cursor.clone());
        });
        Ok(())
    }

    async fn load_descriptors(&self) -> Result<Vec<CustomConfigDescriptor>, StoreError> {
        Ok(self.with_state(|s| s.descriptors.clone()))
    }

    async fn save_descriptors(&self, descriptors: &[CustomConfigDescriptor]) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.descriptors = descriptors.to_vec();
        });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store whose next N calls of a given kind fail with an IO error
    #[derive(Default)]
    pub(crate) struct FaultyPersistence {
        pub inner: MemoryPersistence,
        pub failing_reads: AtomicUsize,
        pub failing_credential_saves: AtomicUsize,
        pub failing_descriptor_saves: AtomicUsize,
    }

    impl FaultyPersistence {
        fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
            match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(StoreError::Io(std::io::Error::other("injected failure"))),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Persistence for FaultyPersistence {
        async fn save_credentials(&self, credentials: &Credentials) -> Result<(), StoreError> {
            Self::trip(&self.failing_credential_saves)?;
            self.inner.save_credentials(credentials).await
        }

        async fn load_credentials(&self, protocol: ProtocolName) -> Result<Option<Credentials>, StoreError> {
            self.inner.load_credentials(protocol).await
        }

        async fn remove_credentials(&self, protocol: ProtocolName) -> Result<(), StoreError> {
            self.inner.remove_credentials(protocol).await
        }

        async fn save_file(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
            self.inner.save_file(path, bytes).await
        }

        async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Self::trip(&self.failing_reads)?;
            self.inner.read_file(path).await
        }

        async fn remove_file(&self, path: &str) -> Result<(), StoreError> {
            self.inner.remove_file(path).await
        }

        async fn load_cursor(&self, network_id: &str) -> Result<Option<SelectorCursor>, StoreError> {
            self.inner.load_cursor(network_id).await
        }

        async fn save_cursor(&self, network_id: &str, cursor: &SelectorCursor) -> Result<(), StoreError> {
            self.inner.save_cursor(network_id, cursor).await
        }

        async fn load_descriptors(&self) -> Result<Vec<CustomConfigDescriptor>, StoreError> {
            self.inner.load_descriptors().await
        }

        async fn save_descriptors(&self, descriptors: &[CustomConfigDescriptor]) -> Result<(), StoreError> {
            Self::trip(&self.failing_descriptor_saves)?;
            self.inner.save_descriptors(descriptors).await
        }
    }

    #[tokio::test]
    async fn test_faulty_persistence_fails_once() {
        let store = FaultyPersistence::default();
        store.inner.save_file("a", b"x").await.unwrap();
        store.failing_reads.store(1, Ordering::SeqCst);

        assert!(store.read_file("a").await.is_err());
        assert_eq!(store.read_file("a").await.unwrap(), Some(b"x".to_vec()));
    }
}
