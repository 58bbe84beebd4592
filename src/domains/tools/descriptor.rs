//! Tool descriptors and the on-disk descriptor store.
//!
//! A descriptor is one JSON file identifying a tool and the code that backs
//! it. The store is just a directory tree of such files; the hot-reload
//! manager re-reads it on every tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::LoadError;

/// Declarative configuration record for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name. Immutable for the lifetime of a registry entry.
    pub name: String,

    /// Which code to load, e.g. `native:echo` or `script:fetch.sh`.
    pub implementation_locator: String,

    /// Semantic version of the tool.
    pub version: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub metadata: ToolMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Kind-specific settings (script interpreter, REST headers, SQL query...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,

    /// Where this descriptor came from. Computed, never read from the file.
    #[serde(default, skip_deserializing)]
    pub source: SourceStamp,
}

fn default_enabled() -> bool {
    true
}

/// Free-form descriptor metadata with a few well-known hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,

    /// Per-tool execution deadline, used when the caller supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Change-detection stamp of a loaded descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStamp {
    pub path: Option<PathBuf>,
    /// blake3 of the descriptor file contents.
    pub checksum: String,
    pub modified_at: Option<DateTime<Utc>>,
}

impl ToolDescriptor {
    /// Parse and check a descriptor from raw file contents.
    pub fn from_slice(bytes: &[u8], path: &Path) -> Result<Self, LoadError> {
        let mut descriptor: ToolDescriptor =
            serde_json::from_slice(bytes).map_err(|e| LoadError::parse(path, e.to_string()))?;
        descriptor.check()?;
        descriptor.source = SourceStamp {
            path: Some(path.to_path_buf()),
            checksum: blake3::hash(bytes).to_hex().to_string(),
            modified_at: None,
        };
        Ok(descriptor)
    }

    /// Enforce field rules serde cannot express.
    pub fn check(&self) -> Result<(), LoadError> {
        if self.name.is_empty() {
            return Err(LoadError::invalid("name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(LoadError::invalid(format!(
                "name '{}' may only contain ASCII letters, digits, '_', '-' and '.'",
                self.name
            )));
        }
        if self.implementation_locator.trim().is_empty() {
            return Err(LoadError::invalid(format!(
                "tool '{}' has an empty implementation_locator",
                self.name
            )));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            LoadError::invalid(format!(
                "tool '{}' has invalid version '{}': {}",
                self.name, self.version, e
            ))
        })?;
        Ok(())
    }

    /// Directory the descriptor was read from, used to resolve relative plugin paths.
    pub fn base_dir(&self) -> Option<&Path> {
        self.source.path.as_deref().and_then(Path::parent)
    }

    /// Per-tool timeout hint, if any.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata.timeout_ms
    }

    /// String value from the kind-specific config block.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// The filesystem tree of descriptor files.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every descriptor file (`*.json`, hidden entries skipped), sorted.
    pub fn scan(&self) -> Result<Vec<PathBuf>, LoadError> {
        if !self.root.is_dir() {
            return Err(LoadError::io(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "descriptor directory not found"),
            ));
        }

        let mut paths = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                LoadError::io(path, std::io::Error::other(e.to_string()))
            })?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some("json")
            {
                paths.push(path.to_path_buf());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Raw bytes of one descriptor file.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        tokio::fs::read(path).await.map_err(|e| LoadError::io(path, e))
    }

    /// Parse descriptor bytes read from `path`, stamping checksum and mtime.
    pub async fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ToolDescriptor, LoadError> {
        let mut descriptor = ToolDescriptor::from_slice(bytes, path)?;
        descriptor.source.modified_at = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(descriptor)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const ECHO: &str = r#"{
        "name": "echo",
        "implementation_locator": "native:echo",
        "version": "1.0.0",
        "metadata": { "category": "util", "tags": ["demo"], "cache_ttl_seconds": 60, "owner": "ops" }
    }"#;

    #[test]
    fn test_parse_minimal_descriptor() {
        let descriptor = ToolDescriptor::from_slice(ECHO.as_bytes(), Path::new("echo.json")).unwrap();
        assert_eq!(descriptor.name, "echo");
        assert!(descriptor.enabled);
        assert_eq!(descriptor.metadata.category.as_deref(), Some("util"));
        assert_eq!(descriptor.metadata.cache_ttl_seconds, Some(60));
        assert_eq!(descriptor.metadata.extra["owner"], "ops");
        assert_eq!(descriptor.source.checksum.len(), 64);
    }

    #[test]
    fn test_checksum_follows_content() {
        let a = ToolDescriptor::from_slice(ECHO.as_bytes(), Path::new("a.json")).unwrap();
        let changed = ECHO.replace("1.0.0", "1.1.0");
        let b = ToolDescriptor::from_slice(changed.as_bytes(), Path::new("a.json")).unwrap();
        assert_ne!(a.source.checksum, b.source.checksum);
    }

    #[test]
    fn test_rejects_bad_version() {
        let bad = ECHO.replace("1.0.0", "one");
        let err = ToolDescriptor::from_slice(bad.as_bytes(), Path::new("x.json")).unwrap_err();
        assert!(matches!(err, LoadError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_rejects_missing_locator() {
        let bad = r#"{ "name": "x", "version": "1.0.0" }"#;
        let err = ToolDescriptor::from_slice(bad.as_bytes(), Path::new("x.json")).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_rejects_bad_name() {
        let bad = ECHO.replace("\"echo\"", "\"echo tool\"");
        assert!(ToolDescriptor::from_slice(bad.as_bytes(), Path::new("x.json")).is_err());
    }

    #[test]
    fn test_scan_finds_nested_json_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("echo.json"), ECHO).unwrap();
        fs::create_dir(dir.path().join("fred")).unwrap();
        fs::write(dir.path().join("fred/series.json"), ECHO).unwrap();
        fs::write(dir.path().join("fred/run.sh"), "echo").unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join(".cache/old.json"), ECHO).unwrap();

        let store = DescriptorStore::new(dir.path());
        let paths = store.scan().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.extension().unwrap() == "json"));
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let store = DescriptorStore::new("/nonexistent/descriptors/12345");
        assert!(store.scan().is_err());
    }

    #[tokio::test]
    async fn test_parse_stamps_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("echo.json");
        fs::write(&path, ECHO).unwrap();

        let store = DescriptorStore::new(dir.path());
        let bytes = store.read(&path).await.unwrap();
        assert_eq!(bytes, ECHO.as_bytes());
        let descriptor = store.parse(&path, &bytes).await.unwrap();
        assert_eq!(descriptor.source.path.as_deref(), Some(path.as_path()));
        assert!(descriptor.source.modified_at.is_some());
        assert_eq!(descriptor.base_dir(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = DescriptorStore::new(dir.path());
        let err = store.read(&dir.path().join("gone.json")).await.unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
