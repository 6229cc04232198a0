//! Warm tier: persisted packets keyed by source content.
//!
//! Writes are fire-and-forget. Reads are awaited by background recovery
//! tasks and never block a cache lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use splice_common::{SpliceError, SpliceResult};
use splice_timeline::{EncoderSettings, SequenceId};

use crate::source_key::fnv1a_64;

/// Namespaced key/value store for encoded packets.
#[async_trait]
pub trait WarmStore: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Read a stored value. A missing entry is `Ok(None)`.
    async fn read(&self, namespace: &str, key: &str) -> SpliceResult<Option<Vec<u8>>>;

    /// Queue a write. Completion is not observable; failures are logged.
    fn write(&self, namespace: &str, key: &str, bytes: Vec<u8>);

    /// Drop every entry in a namespace.
    async fn clear(&self, namespace: &str) -> SpliceResult<()>;
}

/// Namespace holding one sequence's packets for one set of encoder settings.
///
/// Changing any setting changes the namespace, so packets encoded with
/// other settings can never be recovered by mistake.
pub fn namespace_for(sequence_id: &SequenceId, settings: &EncoderSettings) -> String {
    let safe: String = sequence_id
        .as_str()
        .chars()
        .take(48)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "{}-{:08x}-{:016x}",
        safe,
        fnv1a_64(sequence_id.as_str().as_bytes()) as u32,
        fnv1a_64(settings.canonical_string().as_bytes())
    )
}

/// Filesystem-backed warm tier: `<root>/<namespace>/<key>.pkt`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: Arc<PathBuf>,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{key}.pkt"))
    }

    /// Remove every namespace under the root.
    pub async fn clear_all(&self) -> SpliceResult<()> {
        match tokio::fs::remove_dir_all(self.root.as_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpliceError::store(format!(
                "Failed to clear {}: {e}",
                self.root.display()
            ))),
        }
    }
}

#[async_trait]
impl WarmStore for DiskStore {
    fn name(&self) -> &str {
        "disk"
    }

    async fn read(&self, namespace: &str, key: &str) -> SpliceResult<Option<Vec<u8>>> {
        let path = self.entry_path(namespace, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpliceError::store(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write(&self, namespace: &str, key: &str, bytes: Vec<u8>) {
        let path = self.entry_path(namespace, key);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(path = %path.display(), "No runtime for warm-tier write; dropped");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = write_atomically(&path, &bytes).await {
                tracing::warn!(path = %path.display(), error = %e, "Warm-tier write failed");
            }
        });
    }

    async fn clear(&self, namespace: &str) -> SpliceResult<()> {
        let dir = self.root.join(namespace);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpliceError::store(format!(
                "Failed to clear {}: {e}",
                dir.display()
            ))),
        }
    }
}

/// Write through a temporary file so readers never observe a partial entry.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("pkt.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// In-process warm tier, used by tests and `--no-persist` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WarmStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, namespace: &str, key: &str) -> SpliceResult<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self
            .entries
            .lock()
            .map_err(|_| SpliceError::store("memory store lock poisoned"))?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn write(&self, namespace: &str, key: &str, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((namespace.to_string(), key.to_string()), bytes);
        }
    }

    async fn clear(&self, namespace: &str) -> SpliceResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SpliceError::store("memory store lock poisoned"))?;
        entries.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_timeline::{BitrateMode, FrameRate, Quality, VideoCodec};

    fn settings(bitrate_bps: u64) -> EncoderSettings {
        EncoderSettings {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            fps: FrameRate::integer(30),
            bitrate_bps,
            bitrate_mode: BitrateMode::Variable,
            quality: Quality::Balanced,
        }
    }

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("splice-store-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_namespace_tracks_settings() {
        let seq = SequenceId::new("main seq");
        let a = namespace_for(&seq, &settings(8_000_000));
        let b = namespace_for(&seq, &settings(12_000_000));
        assert_ne!(a, b);
        assert!(a.starts_with("main_seq-"));
        assert_eq!(a, namespace_for(&seq, &settings(8_000_000)));
    }

    #[tokio::test]
    async fn test_memory_store_clear_is_namespaced() {
        let store = MemoryStore::new();
        store.write("a", "k1", vec![1]);
        store.write("b", "k1", vec![2]);
        store.clear("a").await.unwrap();
        assert_eq!(store.read("a", "k1").await.unwrap(), None);
        assert_eq!(store.read("b", "k1").await.unwrap(), Some(vec![2]));
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_disk_store_write_then_read() {
        let root = temp_root("rw");
        let store = DiskStore::new(&root);
        store.write("ns", "key", vec![5, 6, 7]);

        let mut found = None;
        for _ in 0..100 {
            found = store.read("ns", "key").await.unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(found, Some(vec![5, 6, 7]));

        store.clear("ns").await.unwrap();
        assert_eq!(store.read("ns", "key").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_disk_store_missing_entry_is_none() {
        let store = DiskStore::new(temp_root("missing"));
        assert_eq!(store.read("nothing", "here").await.unwrap(), None);
        store.clear("nothing").await.unwrap();
    }
}
