//! Content-addressed, file-backed store for opaque KV-cache payloads.
//!
//! Every entry is two files: `<id>.kvc` (payload, optionally wrapped in an
//! SCMP compression envelope) and `<id>.meta` (JSON sidecar: size,
//! checksum, timestamps, compression, KV shape hints). Writes go through a
//! `.tmp` path and are renamed into place.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheStoreError {
    #[error("cache entry not found: {0}")]
    NotFound(String),

    #[error("integrity check failed for {0}: checksum mismatch")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported or unavailable codec: {0:?}")]
    UnsupportedCodec(Compression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Lz4Hc,
    Zstd,
    ZstdFast,
}

impl Compression {
    /// Reflects which codecs are actually linked in this build. `Lz4Hc`
    /// shares `lz4_flex`'s single (non-HC) encoder, so it reports available
    /// but behaves identically to `Lz4` — noted for callers that probe
    /// compression ratio expectations.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            Compression::None | Compression::Lz4 | Compression::Lz4Hc | Compression::Zstd | Compression::ZstdFast
        )
    }
}

const SCMP_MAGIC: [u8; 4] = *b"SCMP";
const SCMP_VERSION: u8 = 1;
const SCMP_HEADER_LEN: usize = 16;

fn scmp_type_tag(compression: Compression) -> u8 {
    match compression {
        Compression::None => 0,
        Compression::Lz4 => 1,
        Compression::Lz4Hc => 2,
        Compression::Zstd => 3,
        Compression::ZstdFast => 4,
    }
}

fn scmp_type_from_tag(tag: u8) -> Option<Compression> {
    Some(match tag {
        0 => Compression::None,
        1 => Compression::Lz4,
        2 => Compression::Lz4Hc,
        3 => Compression::Zstd,
        4 => Compression::ZstdFast,
        _ => return None,
    })
}

fn wrap_scmp(compression: Compression, compressed: &[u8], original_size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SCMP_HEADER_LEN + compressed.len());
    out.extend_from_slice(&SCMP_MAGIC);
    out.push(SCMP_VERSION);
    out.push(scmp_type_tag(compression));
    out.extend_from_slice(&0u16.to_le_bytes()); // flags, unused
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(compressed);
    out
}

struct ScmpHeader {
    compression: Compression,
    original_size: u64,
}

fn try_parse_scmp(data: &[u8]) -> Option<ScmpHeader> {
    if data.len() < SCMP_HEADER_LEN || data[0..4] != SCMP_MAGIC {
        return None;
    }
    let compression = scmp_type_from_tag(data[5])?;
    let original_size = u64::from_le_bytes(data[8..16].try_into().ok()?);
    Some(ScmpHeader {
        compression,
        original_size,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub cache_id: String,
    pub size_bytes: u64,
    pub original_size_bytes: u64,
    pub checksum: u32,
    pub compression: Compression,
    pub created_at: u64,
    pub last_accessed: u64,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub compression: Compression,
    pub model: Option<String>,
}

pub trait CacheStore: Send + Sync {
    fn write(&self, cache_id: &str, bytes: &[u8], options: WriteOptions) -> Result<(), CacheStoreError>;
    fn read(&self, cache_id: &str) -> Result<Vec<u8>, CacheStoreError>;
    fn read_into(&self, cache_id: &str, buffer: &mut Vec<u8>) -> Result<usize, CacheStoreError>;
    fn remove(&self, cache_id: &str) -> Result<bool, CacheStoreError>;
    fn exists(&self, cache_id: &str) -> bool;
    fn touch(&self, cache_id: &str) -> Result<(), CacheStoreError>;
    fn list(&self) -> Vec<String>;
    fn list_by_prefix(&self, prefix: &str) -> Vec<String>;
    fn list_by_model(&self, model: &str) -> Vec<String>;
    fn verify(&self, cache_id: &str) -> Result<bool, CacheStoreError>;
    fn verify_integrity(&self) -> Vec<String>;
    fn compact(&self) -> Result<usize, CacheStoreError>;
    fn clear(&self) -> Result<(), CacheStoreError>;
    fn set_capacity(&self, bytes: u64);
    fn sync(&self) -> Result<(), CacheStoreError>;
}

struct IndexEntry {
    meta: CacheEntryMeta,
}

/// On-disk `CacheStore` under `root/<id>.kvc` + `root/<id>.meta`. An
/// in-memory index mirrors the sidecar metadata so listing/stats never
/// touch disk.
pub struct FileCacheStore {
    root: PathBuf,
    index: RwLock<HashMap<String, IndexEntry>>,
    capacity_bytes: std::sync::atomic::AtomicU64,
}

impl FileCacheStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut index = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("meta") {
                if let Ok(bytes) = fs::read(&path) {
                    if let Ok(meta) = serde_json::from_slice::<CacheEntryMeta>(&bytes) {
                        index.insert(meta.cache_id.clone(), IndexEntry { meta });
                    }
                }
            }
        }

        Ok(Self {
            root,
            index: RwLock::new(index),
            capacity_bytes: std::sync::atomic::AtomicU64::new(u64::MAX),
        })
    }

    fn payload_path(&self, cache_id: &str) -> PathBuf {
        self.root.join(format!("{cache_id}.kvc"))
    }

    fn meta_path(&self, cache_id: &str) -> PathBuf {
        self.root.join(format!("{cache_id}.meta"))
    }

    fn compress(&self, compression: Compression, data: &[u8]) -> Result<Vec<u8>, CacheStoreError> {
        if !compression.is_available() {
            return Err(CacheStoreError::UnsupportedCodec(compression));
        }
        Ok(match compression {
            Compression::None => data.to_vec(),
            Compression::Lz4 | Compression::Lz4Hc => lz4_flex::compress_prepend_size(data),
            Compression::Zstd => zstd::encode_all(data, 3)?,
            Compression::ZstdFast => zstd::encode_all(data, 1)?,
        })
    }

    fn decompress(&self, compression: Compression, data: &[u8], original_size: u64) -> Result<Vec<u8>, CacheStoreError> {
        Ok(match compression {
            Compression::None => data.to_vec(),
            Compression::Lz4 | Compression::Lz4Hc => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| CacheStoreError::Integrity(e.to_string()))?,
            Compression::Zstd | Compression::ZstdFast => {
                let out = zstd::decode_all(data)?;
                debug_assert_eq!(out.len() as u64, original_size);
                out
            }
        })
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheStoreError> {
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CacheStore for FileCacheStore {
    fn write(&self, cache_id: &str, bytes: &[u8], options: WriteOptions) -> Result<(), CacheStoreError> {
        let checksum = crc32fast::hash(bytes);
        let payload = if options.compression == Compression::None {
            bytes.to_vec()
        } else {
            let compressed = self.compress(options.compression, bytes)?;
            wrap_scmp(options.compression, &compressed, bytes.len() as u64)
        };

        self.write_atomic(&self.payload_path(cache_id), &payload)?;

        let now = now_unix();
        let meta = CacheEntryMeta {
            cache_id: cache_id.to_string(),
            size_bytes: payload.len() as u64,
            original_size_bytes: bytes.len() as u64,
            checksum,
            compression: options.compression,
            created_at: now,
            last_accessed: now,
            model: options.model,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|e| CacheStoreError::Integrity(e.to_string()))?;
        self.write_atomic(&self.meta_path(cache_id), &meta_bytes)?;

        self.index
            .write()
            .unwrap()
            .insert(cache_id.to_string(), IndexEntry { meta });
        Ok(())
    }

    fn read(&self, cache_id: &str) -> Result<Vec<u8>, CacheStoreError> {
        let mut buffer = Vec::new();
        self.read_into(cache_id, &mut buffer)?;
        Ok(buffer)
    }

    fn read_into(&self, cache_id: &str, buffer: &mut Vec<u8>) -> Result<usize, CacheStoreError> {
        let raw = fs::read(self.payload_path(cache_id))
            .map_err(|_| CacheStoreError::NotFound(cache_id.to_string()))?;

        let decoded = match try_parse_scmp(&raw) {
            Some(header) => self.decompress(header.compression, &raw[SCMP_HEADER_LEN..], header.original_size)?,
            None => raw,
        };

        let index = self.index.read().unwrap();
        if let Some(entry) = index.get(cache_id) {
            let checksum = crc32fast::hash(&decoded);
            if checksum != entry.meta.checksum {
                return Err(CacheStoreError::Integrity(cache_id.to_string()));
            }
        }

        buffer.clear();
        buffer.extend_from_slice(&decoded);
        Ok(buffer.len())
    }

    fn remove(&self, cache_id: &str) -> Result<bool, CacheStoreError> {
        let existed = self.exists(cache_id);
        let _ = fs::remove_file(self.payload_path(cache_id));
        let _ = fs::remove_file(self.meta_path(cache_id));
        self.index.write().unwrap().remove(cache_id);
        Ok(existed)
    }

    fn exists(&self, cache_id: &str) -> bool {
        self.index.read().unwrap().contains_key(cache_id)
    }

    fn touch(&self, cache_id: &str) -> Result<(), CacheStoreError> {
        let mut index = self.index.write().unwrap();
        let entry = index
            .get_mut(cache_id)
            .ok_or_else(|| CacheStoreError::NotFound(cache_id.to_string()))?;
        entry.meta.last_accessed = now_unix();
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        self.index.read().unwrap().keys().cloned().collect()
    }

    fn list_by_prefix(&self, prefix: &str) -> Vec<String> {
        self.index
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn list_by_model(&self, model: &str) -> Vec<String> {
        self.index
            .read()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.meta.model.as_deref() == Some(model))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn verify(&self, cache_id: &str) -> Result<bool, CacheStoreError> {
        match self.read(cache_id) {
            Ok(_) => Ok(true),
            Err(CacheStoreError::Integrity(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn verify_integrity(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|id| !matches!(self.verify(id), Ok(true)))
            .collect()
    }

    fn compact(&self) -> Result<usize, CacheStoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !self.exists(stem) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), CacheStoreError> {
        let ids: Vec<String> = self.list();
        for id in ids {
            self.remove(&id)?;
        }
        Ok(())
    }

    fn set_capacity(&self, bytes: u64) {
        self.capacity_bytes.store(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    fn sync(&self) -> Result<(), CacheStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_round_trip_uncompressed() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        store.write("abc", b"hello world", WriteOptions::default()).unwrap();

        let bytes = store.read("abc").unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn test_write_read_round_trip_zstd() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        let payload = vec![7u8; 4096];
        store
            .write(
                "abc",
                &payload,
                WriteOptions {
                    compression: Compression::Zstd,
                    model: Some("m1".to_string()),
                },
            )
            .unwrap();

        let bytes = store.read("abc").unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(store.list_by_model("m1"), vec!["abc".to_string()]);
    }

    #[test]
    fn test_write_read_round_trip_lz4() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        let payload = (0..1000).map(|i| (i % 17) as u8).collect::<Vec<u8>>();
        store
            .write("abc", &payload, WriteOptions { compression: Compression::Lz4, model: None })
            .unwrap();
        assert_eq!(store.read("abc").unwrap(), payload);
    }

    #[test]
    fn test_read_missing_entry_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        let err = store.read("missing").unwrap_err();
        assert!(matches!(err, CacheStoreError::NotFound(_)));
    }

    #[test]
    fn test_remove_and_exists() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        store.write("abc", b"data", WriteOptions::default()).unwrap();
        assert!(store.exists("abc"));

        assert!(store.remove("abc").unwrap());
        assert!(!store.exists("abc"));
    }

    #[test]
    fn test_reopen_reloads_index_from_sidecars() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileCacheStore::open(tmp.path()).unwrap();
            store.write("abc", b"data", WriteOptions::default()).unwrap();
        }
        let reopened = FileCacheStore::open(tmp.path()).unwrap();
        assert!(reopened.exists("abc"));
        assert_eq!(reopened.read("abc").unwrap(), b"data");
    }

    #[test]
    fn test_verify_integrity_detects_corrupted_payload() {
        let tmp = TempDir::new().unwrap();
        let store = FileCacheStore::open(tmp.path()).unwrap();
        store.write("abc", b"hello world", WriteOptions::default()).unwrap();

        fs::write(tmp.path().join("abc.kvc"), b"corrupted!!!").unwrap();
        let bad = store.verify_integrity();
        assert_eq!(bad, vec!["abc".to_string()]);
    }
}
