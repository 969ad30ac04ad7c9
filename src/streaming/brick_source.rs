use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use crate::error::{EngineError, EngineResult};

/// Transport for dataset files (manifest and bricks)
///
/// Paths are relative to the dataset root, e.g. `level_0/brick_1_2_3.bin`.
pub trait BrickSource: Send + Sync + 'static {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, EngineResult<Vec<u8>>>;

    /// Human readable location, used in logs
    fn describe(&self) -> String;
}

/// Reads dataset files from a local directory
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BrickSource for FileSource {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, EngineResult<Vec<u8>>> {
        async move {
            let full_path = self.root.join(path);
            tokio::fs::read(&full_path).await.map_err(|e| EngineError::Io {
                message: format!("{}: {}", full_path.display(), e),
            })
        }
        .boxed()
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// In-process dataset store
///
/// Counts fetches per path and can inject latency, which makes it the transport of
/// choice for embedding small datasets and for exercising the cache.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: RwLock<FxHashMap<String, Vec<u8>>>,
    fetch_counts: RwLock<FxHashMap<String, u64>>,
    total_fetches: AtomicU64,
    latency: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(path, bytes)` pairs
    pub fn from_files(files: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        let source = Self::new();
        for (path, bytes) in files {
            source.insert(path, bytes);
        }
        source
    }

    /// Delay every fetch by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.write().insert(path.into(), bytes);
    }

    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.files.write().remove(path)
    }

    /// Number of fetches issued for `path`, successful or not
    pub fn fetch_count(&self, path: &str) -> u64 {
        self.fetch_counts.read().get(path).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::Relaxed)
    }
}

impl BrickSource for MemorySource {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, EngineResult<Vec<u8>>> {
        async move {
            self.total_fetches.fetch_add(1, Ordering::Relaxed);
            *self.fetch_counts.write().entry(path.to_string()).or_insert(0) += 1;

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            self.files.read().get(path).cloned().ok_or_else(|| EngineError::Io {
                message: format!("{} not found", path),
            })
        }
        .boxed()
    }

    fn describe(&self) -> String {
        format!("memory ({} files)", self.files.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_counts_fetches() {
        let source = MemorySource::from_files([("a.bin".to_string(), vec![1, 2, 3])]);

        assert_eq!(source.fetch("a.bin").await.expect("present"), vec![1, 2, 3]);
        assert!(source.fetch("missing.bin").await.is_err());

        assert_eq!(source.fetch_count("a.bin"), 1);
        assert_eq!(source.fetch_count("missing.bin"), 1);
        assert_eq!(source.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_file_source_reads_relative_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("level_0")).expect("mkdir");
        std::fs::write(dir.path().join("level_0/brick_0_0_0.bin"), [7u8; 4]).expect("write");

        let source = FileSource::new(dir.path());
        let bytes = source.fetch("level_0/brick_0_0_0.bin").await.expect("read");
        assert_eq!(bytes, vec![7u8; 4]);

        let err = source.fetch("level_0/brick_9_9_9.bin").await.unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
