//! Descriptor sources backed by memory or a directory of JSON files.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::{ChainDescriptor, RuntimeError, RuntimeResult};
use crate::ports::DescriptorSource;

/// Descriptors bundled with the application.
#[derive(Clone, Debug, Default)]
pub struct StaticDescriptorSource {
    descriptors: HashMap<String, ChainDescriptor>,
}

impl StaticDescriptorSource {
    /// Source serving `descriptors` under their own keys.
    pub fn new(descriptors: impl IntoIterator<Item = ChainDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.key.clone(), d))
                .collect(),
        }
    }

    /// Known keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }
}

#[async_trait]
impl DescriptorSource for StaticDescriptorSource {
    async fn load(&self, key: &str) -> RuntimeResult<ChainDescriptor> {
        self.descriptors
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownDescriptor(key.to_string()))
    }
}

/// Reads `<dir>/<key>.json`.
#[derive(Clone, Debug)]
pub struct FileDescriptorSource {
    dir: PathBuf,
}

impl FileDescriptorSource {
    /// Source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory searched for descriptor files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> RuntimeResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(RuntimeError::descriptor_load(key, "invalid descriptor key"));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl DescriptorSource for FileDescriptorSource {
    async fn load(&self, key: &str) -> RuntimeResult<ChainDescriptor> {
        let path = self.path_for(key)?;

        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RuntimeError::UnknownDescriptor(key.to_string()));
            }
            Err(e) => return Err(RuntimeError::descriptor_load(key, e)),
        };

        let mut descriptor: ChainDescriptor = serde_json::from_str(&source)
            .map_err(|e| RuntimeError::descriptor_load(key, format!("{}: {e}", path.display())))?;
        if descriptor.key.is_empty() {
            descriptor.key = key.to_string();
        }

        debug!(key, path = %path.display(), pallets = descriptor.pallets.len(), "descriptor loaded");
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PalletDescriptor;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticDescriptorSource::new([ChainDescriptor::new("polkadot")]);

        assert_eq!(source.load("polkadot").await.unwrap().key, "polkadot");
        assert!(matches!(
            source.load("kusama").await,
            Err(RuntimeError::UnknownDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn test_file_source_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ChainDescriptor::new("dev")
            .with_pallet(PalletDescriptor::new("System").storage(["Number"]));
        std::fs::write(
            dir.path().join("dev.json"),
            serde_json::to_string(&descriptor).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("keyless.json"),
            json!({ "pallets": [] }).to_string(),
        )
        .unwrap();

        let source = FileDescriptorSource::new(dir.path());

        assert_eq!(source.load("dev").await.unwrap(), descriptor);
        assert_eq!(source.load("keyless").await.unwrap().key, "keyless");
    }

    #[tokio::test]
    async fn test_file_source_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let source = FileDescriptorSource::new(dir.path());

        assert!(matches!(
            source.load("missing").await,
            Err(RuntimeError::UnknownDescriptor(_))
        ));
        assert!(matches!(
            source.load("broken").await,
            Err(RuntimeError::DescriptorLoad { .. })
        ));
        assert!(matches!(
            source.load("../etc/passwd").await,
            Err(RuntimeError::DescriptorLoad { .. })
        ));
    }
}
