//! Local data sources: plain files, the application bundle, and resources
//! compiled into the binary.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DataSource, LoadingResult};
use crate::error::{Error, Result};

/// Reads images from the local filesystem
#[derive(Debug, Clone)]
pub struct FileSource {
    root: Option<PathBuf>,
    result: LoadingResult,
}

impl FileSource {
    /// Absolute or working-directory relative paths
    pub fn disk() -> Self {
        Self {
            root: None,
            result: LoadingResult::Disk,
        }
    }

    /// Paths relative to an application bundle directory
    pub fn bundle(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            result: LoadingResult::ApplicationBundle,
        }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let path = Path::new(location);
        match &self.root {
            None => Ok(path.to_path_buf()),
            Some(root) => {
                let escapes = path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
                if escapes {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is outside the bundle", location),
                    )));
                }
                Ok(root.join(path))
            }
        }
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn loading_result(&self) -> LoadingResult {
        self.result
    }

    async fn fetch(&self, location: &str, token: &CancellationToken) -> Result<Bytes> {
        let path = self.resolve(location)?;
        debug!("Reading image file {}", path.display());

        let data = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            data = tokio::fs::read(&path) => data?,
        };
        Ok(Bytes::from(data))
    }
}

/// Named in-memory resources
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    resources: HashMap<String, Bytes>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource
    pub fn with_resource(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.resources.insert(name.into(), data.into());
        self
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl DataSource for EmbeddedSource {
    fn loading_result(&self) -> LoadingResult {
        LoadingResult::CompiledResource
    }

    async fn fetch(&self, location: &str, token: &CancellationToken) -> Result<Bytes> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.resources.get(location).cloned().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no embedded resource named {}", location),
            ))
        })
    }
}
