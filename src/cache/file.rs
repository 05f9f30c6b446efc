//! File-backed storage engine
//!
//! Stores every key as one file in an XDG-compliant cache directory
//! (`~/.cache/metafetch/` on Linux). File names combine a readable prefix of the
//! key with a hash of the whole key, since request keys are full URLs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::engine::{EngineError, KvEngine};

/// Longest key prefix kept in a file name
const NAME_PREFIX_LEN: usize = 64;

/// Hex digits of the key hash kept in a file name
const NAME_HASH_LEN: usize = 16;

/// Engine writing one file per key
#[derive(Debug, Clone)]
pub struct FileEngine {
    cache_dir: PathBuf,
}

impl FileEngine {
    /// Creates an engine in the XDG cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "metafetch")?;
        Some(Self::with_dir(project_dirs.cache_dir().to_path_buf()))
    }

    /// Creates an engine with a custom cache directory
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path of the file backing `key`
    fn cache_path(&self, key: &str) -> PathBuf {
        let prefix: String = key
            .chars()
            .take(NAME_PREFIX_LEN)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();

        let hash = hex::encode(Sha256::digest(key.as_bytes()));

        self.cache_dir
            .join(format!("{}-{}.cache", prefix, &hash[..NAME_HASH_LEN]))
    }
}

#[async_trait]
impl KvEngine for FileEngine {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        match fs::read(self.cache_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        fs::create_dir_all(&self.cache_dir).await?;
        fs::write(self.cache_path(key), value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        match fs::remove_file(self.cache_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_engine() -> (FileEngine, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine = FileEngine::with_dir(temp_dir.path().to_path_buf());
        (engine, temp_dir)
    }

    #[tokio::test]
    async fn test_set_creates_file_in_cache_directory() {
        let (engine, temp_dir) = create_test_engine();

        engine.set("test_key", b"0000000000payload").await.expect("Write should succeed");

        let files: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1, "Exactly one cache file should exist");
    }

    #[test]
    fn test_cache_path_is_stable() {
        let engine = FileEngine::with_dir(PathBuf::from("/cache"));

        assert_eq!(
            engine.cache_path("abc"),
            PathBuf::from("/cache/abc-ba7816bf8f01cfea.cache")
        );

        let long = "x".repeat(80);
        assert_ne!(
            engine.cache_path(&format!("{}a", long)),
            engine.cache_path(&format!("{}b", long))
        );
    }

    #[tokio::test]
    async fn test_get_returns_none_for_missing_key() {
        let (engine, _temp_dir) = create_test_engine();

        let result = engine.get("nonexistent_key").await.unwrap();

        assert!(result.is_none(), "Should return None for missing key");
    }

    #[tokio::test]
    async fn test_roundtrip_keeps_bytes() {
        let (engine, _temp_dir) = create_test_engine();
        let key = "tmdb.reqapi.https://api.themoviedb.org/3/movie/550?language=en";

        engine.set(key, &[0, 1, 2, 255]).await.unwrap();

        assert_eq!(engine.get(key).await.unwrap(), Some(vec![0, 1, 2, 255]));
    }

    #[tokio::test]
    async fn test_set_creates_directory_if_missing() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let nested_path = temp_dir.path().join("nested").join("cache").join("dir");
        let engine = FileEngine::with_dir(nested_path.clone());

        engine.set("nested_key", b"data").await.expect("Write should succeed");

        assert!(nested_path.exists(), "Nested directory should be created");
    }

    #[tokio::test]
    async fn test_overwrite_existing_key() {
        let (engine, _temp_dir) = create_test_engine();

        engine.set("overwrite_key", b"first").await.unwrap();
        engine.set("overwrite_key", b"second").await.unwrap();

        assert_eq!(engine.get("overwrite_key").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_removes_file_and_tolerates_missing() {
        let (engine, _temp_dir) = create_test_engine();

        engine.set("gone", b"x").await.unwrap();
        engine.delete("gone").await.unwrap();
        engine.delete("gone").await.unwrap();

        assert!(engine.get("gone").await.unwrap().is_none());
    }

    #[test]
    fn test_keys_sharing_a_prefix_get_distinct_files() {
        let engine = FileEngine::with_dir(PathBuf::from("/tmp/metafetch"));
        let base = "x".repeat(NAME_PREFIX_LEN);

        let a = engine.cache_path(&format!("{}a", base));
        let b = engine.cache_path(&format!("{}b", base));

        assert_ne!(a, b);
    }

    #[test]
    fn test_new_creates_xdg_compliant_path() {
        if let Some(engine) = FileEngine::new() {
            let path_str = engine.dir().to_string_lossy();
            assert!(
                path_str.contains("metafetch"),
                "Cache path should contain project name"
            );
        }
        // Test passes if new() returns None (e.g., no home directory in CI)
    }
}
