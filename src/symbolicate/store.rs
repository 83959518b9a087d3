use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::SourceMapError;

/// Source of uploaded source map files, keyed by release and file name.
#[async_trait]
pub trait SourceMapStore: Send + Sync {
    /// Returns the map text, or `None` if no such map was uploaded.
    async fn fetch(&self, release: &str, file: &str) -> Result<Option<String>, SourceMapError>;

    /// Stores a map, replacing any previous upload with the same key.
    async fn put(&self, release: &str, file: &str, body: &[u8]) -> Result<(), SourceMapError>;
}

/// Filesystem store laid out as `<root>/<release>/<file>`.
#[derive(Debug, Clone)]
pub struct FsSourceMapStore {
    root: PathBuf,
}

impl FsSourceMapStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, release: &str, file: &str) -> Result<PathBuf, SourceMapError> {
        if !is_safe_component(release) {
            return Err(SourceMapError::InvalidName(release.to_string()));
        }
        if !is_safe_component(file) {
            return Err(SourceMapError::InvalidName(file.to_string()));
        }
        Ok(self.root.join(release).join(file))
    }
}

/// A single, non-traversing path component.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Reduces an uploaded file name to its final path component.
pub fn sanitize_file_name(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next()?;
    is_safe_component(base).then_some(base)
}

#[async_trait]
impl SourceMapStore for FsSourceMapStore {
    async fn fetch(&self, release: &str, file: &str) -> Result<Option<String>, SourceMapError> {
        let path = self.path_for(release, file)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceMapError::Io(e)),
        }
    }

    async fn put(&self, release: &str, file: &str, body: &[u8]) -> Result<(), SourceMapError> {
        let path = self.path_for(release, file)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, body).await?;
        tracing::info!(path = %path.display(), bytes = body.len(), "stored source map");
        Ok(())
    }
}
