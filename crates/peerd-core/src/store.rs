//! Persistent peer database
//!
//! The database is a TOML document with one `[[peer]]` table per record,
//! sorted by ASN. Every mutation rewrites the whole file through a
//! temporary file that is synced and renamed over the target.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{Asn, PeerRecord};

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    peer: Vec<PeerRecord>,
}

/// In-memory registry backed by the database file
#[derive(Debug)]
pub struct PeerStore {
    path: PathBuf,
    peers: BTreeMap<Asn, PeerRecord>,
}

impl PeerStore {
    /// Read the database at `path`. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No peer database at {}, starting empty", path.display());
                return Ok(Self {
                    path,
                    peers: BTreeMap::new(),
                });
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };

        let file: StoreFile = toml::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if file.version != FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("unsupported format version {}", file.version),
            });
        }

        let mut peers = BTreeMap::new();
        for record in file.peer {
            let asn = record.asn;
            if record.wireguard_endpoint.is_empty()
                || record.wireguard_link_local.is_empty()
                || record.wireguard_public_key.is_empty()
            {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("incomplete record for AS{}", asn),
                });
            }
            if peers.insert(asn, record).is_some() {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("duplicate record for AS{}", asn),
                });
            }
        }

        tracing::info!("Loaded {} peer(s) from {}", peers.len(), path.display());
        Ok(Self { path, peers })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self, asn: Asn) -> bool {
        self.peers.contains_key(&asn)
    }

    pub fn get(&self, asn: Asn) -> Result<&PeerRecord, StoreError> {
        self.peers.get(&asn).ok_or(StoreError::NotFound(asn))
    }

    /// Add a record and persist. Memory is left unchanged if the write fails.
    pub fn insert(&mut self, record: PeerRecord) -> Result<(), StoreError> {
        let asn = record.asn;
        if self.peers.contains_key(&asn) {
            return Err(StoreError::AlreadyExists(asn));
        }

        self.peers.insert(asn, record);
        if let Err(e) = self.persist() {
            self.peers.remove(&asn);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a record and persist. The record stays out of memory even if
    /// the write fails; the next successful write (or [`flush`](Self::flush))
    /// drops it from disk.
    pub fn remove(&mut self, asn: Asn) -> Result<PeerRecord, StoreError> {
        let record = self.peers.remove(&asn).ok_or(StoreError::NotFound(asn))?;
        self.persist()?;
        Ok(record)
    }

    /// Rewrite the database from memory
    pub fn flush(&self) -> Result<(), StoreError> {
        self.persist()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            version: FORMAT_VERSION,
            peer: self.peers.values().cloned().collect(),
        };
        let content = toml::to_string(&file)?;
        write_atomic(&self.path, content.as_bytes()).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    // Make the rename itself durable
    if let Err(e) = File::open(&dir).and_then(|d| d.sync_all()) {
        tracing::debug!("Failed to sync directory {}: {}", dir.display(), e);
    }
    Ok(())
}
