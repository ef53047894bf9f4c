//! Content-Addressable Store (§4.1).
//!
//! Every artifact is written once under `<root>/<type>/<hash>.bin` with a
//! sidecar `<hash>.meta.json`, and its hash is appended to an append-only
//! `registry.jsonl` log that doubles as a cheap existence index. Writes are
//! atomic: content lands in a temp file in the same directory, then is
//! renamed into place, so a crash mid-write never leaves a half-written
//! blob visible under its final name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::artifact::{hash_bytes, ArtifactId, ArtifactType};
use crate::error::{Error, Result};

/// Sidecar metadata persisted alongside each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_type: String,
    pub hash: ArtifactId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub parents: Vec<ArtifactId>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// One line of `registry.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    artifact_type: String,
    hash: ArtifactId,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// A content-addressed, append-only artifact store rooted at a directory.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if absent) a CAS rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::StorageUnavailable(format!("cannot create CAS root: {}", e)))?;
        Ok(Self { root })
    }

    fn type_dir(&self, artifact_type: ArtifactType) -> PathBuf {
        self.root.join(artifact_type.as_str())
    }

    fn blob_path(&self, artifact_type: ArtifactType, hash: &str) -> PathBuf {
        self.type_dir(artifact_type).join(format!("{}.bin", hash))
    }

    fn meta_path(&self, artifact_type: ArtifactType, hash: &str) -> PathBuf {
        self.type_dir(artifact_type)
            .join(format!("{}.meta.json", hash))
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.jsonl")
    }

    /// Serialize and store `value` as canonical JSON, returning its
    /// content-address. Idempotent: re-putting identical content is a
    /// no-op on the blob itself but still merges any new parent links.
    ///
    /// "Canonical" depends on the caller: `serde_json` does not sort object
    /// keys, so any map-typed field reachable from `value` must use
    /// `BTreeMap` (not `HashMap`, whose iteration order is randomized per
    /// process) or hashing the same content twice will not produce the same
    /// id.
    pub fn put<T: Serialize>(
        &self,
        artifact_type: ArtifactType,
        value: &T,
        parents: Vec<ArtifactId>,
    ) -> Result<ArtifactId> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let hash = hash_bytes(&bytes);
        self.put_bytes(artifact_type, &hash, &bytes, parents)?;
        Ok(hash)
    }

    fn put_bytes(
        &self,
        artifact_type: ArtifactType,
        hash: &str,
        bytes: &[u8],
        parents: Vec<ArtifactId>,
    ) -> Result<()> {
        let dir = self.type_dir(artifact_type);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::StorageUnavailable(format!("cannot create {:?}: {}", dir, e)))?;

        let blob_path = self.blob_path(artifact_type, hash);
        if !blob_path.exists() {
            self.atomic_write(&dir, &blob_path, bytes)?;
            self.append_registry(artifact_type, hash)?;
            debug!(%hash, artifact_type = %artifact_type, "wrote new artifact");
        }

        self.merge_metadata(artifact_type, hash, parents)?;
        Ok(())
    }

    fn atomic_write(&self, dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile_in(dir)?;
        tmp.write_all(bytes)
            .map_err(|e| Error::StorageUnavailable(format!("write failed: {}", e)))?;
        tmp.flush()
            .map_err(|e| Error::StorageUnavailable(format!("flush failed: {}", e)))?;
        let tmp_path = tmp.path().to_path_buf();
        std::fs::rename(&tmp_path, dest)
            .map_err(|e| Error::StorageUnavailable(format!("rename failed: {}", e)))?;
        Ok(())
    }

    fn merge_metadata(
        &self,
        artifact_type: ArtifactType,
        hash: &str,
        new_parents: Vec<ArtifactId>,
    ) -> Result<()> {
        let meta_path = self.meta_path(artifact_type, hash);
        let mut meta = if meta_path.exists() {
            let text = std::fs::read_to_string(&meta_path)?;
            serde_json::from_str(&text)?
        } else {
            ArtifactMetadata {
                artifact_type: artifact_type.as_str().to_string(),
                hash: hash.to_string(),
                created_at: chrono::Utc::now(),
                parents: Vec::new(),
                tags: HashMap::new(),
            }
        };

        for parent in new_parents {
            if !meta.parents.contains(&parent) {
                meta.parents.push(parent);
            }
        }

        let bytes = serde_json::to_vec_pretty(&meta)?;
        let dir = self.type_dir(artifact_type);
        self.atomic_write(&dir, &meta_path, &bytes)
    }

    fn append_registry(&self, artifact_type: ArtifactType, hash: &str) -> Result<()> {
        let entry = RegistryEntry {
            artifact_type: artifact_type.as_str().to_string(),
            hash: hash.to_string(),
            created_at: chrono::Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.registry_path())
            .map_err(|e| Error::StorageUnavailable(format!("cannot open registry: {}", e)))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::StorageUnavailable(format!("registry append failed: {}", e)))
    }

    /// Fetch and deserialize an artifact by type and hash.
    pub fn get<T: for<'de> Deserialize<'de>>(
        &self,
        artifact_type: ArtifactType,
        hash: &str,
    ) -> Result<T> {
        let path = self.blob_path(artifact_type, hash);
        let bytes = std::fs::read(&path).map_err(|_| Error::NotFound(format!("{}/{}", artifact_type, hash)))?;
        let verify = hash_bytes(&bytes);
        if verify != hash {
            warn!(expected = %hash, actual = %verify, "CAS integrity mismatch");
            return Err(Error::IntegrityViolation(hash.to_string()));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetch sidecar metadata for an artifact.
    pub fn metadata(&self, artifact_type: ArtifactType, hash: &str) -> Result<ArtifactMetadata> {
        let path = self.meta_path(artifact_type, hash);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("{}/{}.meta", artifact_type, hash)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Whether an artifact of this type/hash is already stored.
    pub fn contains(&self, artifact_type: ArtifactType, hash: &str) -> bool {
        self.blob_path(artifact_type, hash).exists()
    }

    /// Store `value` like [`Self::put`], additionally merging `tags` into
    /// its sidecar metadata. Used for cache-key lookups (e.g. the Analysis
    /// Agent's `hash(framework‖doc‖model)` key, §4.6) that don't fit the
    /// content-address itself.
    pub fn put_tagged<T: Serialize>(
        &self,
        artifact_type: ArtifactType,
        value: &T,
        parents: Vec<ArtifactId>,
        tags: HashMap<String, String>,
    ) -> Result<ArtifactId> {
        let hash = self.put(artifact_type, value, parents)?;
        self.merge_tags(artifact_type, &hash, tags)?;
        Ok(hash)
    }

    fn merge_tags(&self, artifact_type: ArtifactType, hash: &str, new_tags: HashMap<String, String>) -> Result<()> {
        let meta_path = self.meta_path(artifact_type, hash);
        let text = std::fs::read_to_string(&meta_path)
            .map_err(|_| Error::NotFound(format!("{}/{}.meta", artifact_type, hash)))?;
        let mut meta: ArtifactMetadata = serde_json::from_str(&text)?;
        meta.tags.extend(new_tags);
        let bytes = serde_json::to_vec_pretty(&meta)?;
        let dir = self.type_dir(artifact_type);
        self.atomic_write(&dir, &meta_path, &bytes)
    }

    /// Find the first artifact of a type whose metadata carries `key ==
    /// value`, scanning the registry in insertion order. Used to reuse a
    /// previously computed artifact instead of recomputing it.
    pub fn find_by_tag(
        &self,
        artifact_type: ArtifactType,
        key: &str,
        value: &str,
    ) -> Result<Option<ArtifactId>> {
        for hash in self.list(artifact_type)? {
            if let Ok(meta) = self.metadata(artifact_type, &hash) {
                if meta.tags.get(key).map(|v| v.as_str()) == Some(value) {
                    return Ok(Some(hash));
                }
            }
        }
        Ok(None)
    }

    /// List every hash ever written for a type, in insertion order, by
    /// replaying the append-only registry.
    pub fn list(&self, artifact_type: ArtifactType) -> Result<Vec<ArtifactId>> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        let mut hashes = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: RegistryEntry = serde_json::from_str(line)?;
            if entry.artifact_type == artifact_type.as_str() {
                hashes.push(entry.hash);
            }
        }
        Ok(hashes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Named temp file in `dir`, used so the final `rename` is same-filesystem
/// and therefore atomic.
fn tempfile_in(dir: &Path) -> Result<tempfile::NamedTempFile> {
    tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::StorageUnavailable(format!("tempfile creation failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let hash = store
            .put(ArtifactType::AnalysisResult, &Sample { value: 42 }, vec![])
            .unwrap();
        let fetched: Sample = store.get(ArtifactType::AnalysisResult, &hash).unwrap();
        assert_eq!(fetched, Sample { value: 42 });
    }

    #[test]
    fn test_put_is_content_addressed_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let h1 = store
            .put(ArtifactType::Work, &Sample { value: 7 }, vec![])
            .unwrap();
        let h2 = store
            .put(ArtifactType::Work, &Sample { value: 7 }, vec![])
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.list(ArtifactType::Work).unwrap().len(), 1);
    }

    #[test]
    fn test_parents_merge_across_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let hash = store
            .put(ArtifactType::Work, &Sample { value: 1 }, vec!["parent-a".to_string()])
            .unwrap();
        store
            .put(ArtifactType::Work, &Sample { value: 1 }, vec!["parent-b".to_string()])
            .unwrap();
        let meta = store.metadata(ArtifactType::Work, &hash).unwrap();
        assert_eq!(meta.parents.len(), 2);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let result: Result<Sample> = store.get(ArtifactType::Work, "deadbeef");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_find_by_tag_locates_tagged_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let mut tags = HashMap::new();
        tags.insert("cache_key".to_string(), "abc123".to_string());
        let hash = store
            .put_tagged(ArtifactType::AnalysisResult, &Sample { value: 9 }, vec![], tags)
            .unwrap();
        let found = store
            .find_by_tag(ArtifactType::AnalysisResult, "cache_key", "abc123")
            .unwrap();
        assert_eq!(found, Some(hash));
        assert_eq!(
            store
                .find_by_tag(ArtifactType::AnalysisResult, "cache_key", "nope")
                .unwrap(),
            None
        );
    }
}
