//! Link-based sharing: the document as one text value.
//!
//! A [`Locator`] is wherever that value lives (a URL parameter, an export
//! file). Publishing writes the encoded snapshot; loading decodes it and merges
//! every block into the store. Anything unreadable loads as an empty document.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use folio_core::codec;
use folio_core::SnapshotError;
use thiserror::Error;

use crate::store::{BlockStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("Locator I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a shareable document value is kept.
pub trait Locator: Send + Sync {
    /// The stored value, `None` when nothing was stored yet.
    fn read(&self) -> Result<Option<String>, LocatorError>;

    fn write(&self, value: &str) -> Result<(), LocatorError>;
}

/// Locator held in memory, standing in for a link parameter.
#[derive(Debug, Default)]
pub struct MemoryLocator {
    value: Mutex<Option<String>>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(value.into())),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Locator for MemoryLocator {
    fn read(&self) -> Result<Option<String>, LocatorError> {
        Ok(self.value())
    }

    fn write(&self, value: &str) -> Result<(), LocatorError> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.to_string());
        Ok(())
    }
}

/// Manual export file.
#[derive(Debug, Clone)]
pub struct FileLocator {
    path: PathBuf,
}

impl FileLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Locator for FileLocator {
    fn read(&self) -> Result<Option<String>, LocatorError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LocatorError::Io(e.to_string())),
        }
    }

    fn write(&self, value: &str) -> Result<(), LocatorError> {
        std::fs::write(&self.path, value).map_err(|e| LocatorError::Io(e.to_string()))
    }
}

/// Publishes a store to a locator and loads it back.
pub struct LinkSync<L> {
    store: Arc<BlockStore>,
    locator: L,
}

impl<L: Locator> LinkSync<L> {
    pub fn new(store: Arc<BlockStore>, locator: L) -> Self {
        Self { store, locator }
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Encode the live document and write it. Returns the encoded value.
    pub fn publish(&self) -> Result<String, LocatorError> {
        let snapshot = self.store.snapshot();
        let encoded = codec::encode(&snapshot)?;
        self.locator.write(&encoded)?;
        log::info!(
            "Published {} blocks ({} chars)",
            snapshot.len(),
            encoded.len()
        );
        Ok(encoded)
    }

    /// Merge the locator's document into the store.
    ///
    /// Returns how many blocks changed. A missing or corrupt value is an
    /// empty document; only storage failures are errors.
    pub fn load(&self) -> Result<usize, LocatorError> {
        let value = match self.locator.read() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Locator unreadable, loading an empty document: {e}");
                None
            }
        };
        let snapshot = codec::decode_or_empty(value.as_deref());
        let changed = self.store.import_all(snapshot.blocks)?;
        log::info!("Loaded shared document ({changed} blocks changed)");
        Ok(changed)
    }
}
