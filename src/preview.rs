use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tempfile::TempDir;
use tracing::debug;
use url::Url;

/// Local preview for a pending media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    /// Inline `data:` URI, nothing to release.
    DataUri(String),
    /// Temporary file exposed as a URL; must be revoked.
    ObjectUrl(ObjectUrl),
}

impl Preview {
    pub fn url(&self) -> &str {
        match self {
            Preview::DataUri(uri) => uri,
            Preview::ObjectUrl(object) => &object.url,
        }
    }

    pub fn object_url(&self) -> Option<&ObjectUrl> {
        match self {
            Preview::ObjectUrl(object) => Some(object),
            Preview::DataUri(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl {
    pub url: String,
    path: PathBuf,
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Owner of every temporary object URL handed out for previews.
pub struct ObjectUrls {
    dir: TempDir,
    live: HashSet<String>,
}

impl ObjectUrls {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("campus-hub-previews-")
            .tempdir()
            .context("preview: create temp dir")?;
        Ok(Self {
            dir,
            live: HashSet::new(),
        })
    }

    pub fn create(&mut self, bytes: &[u8], extension: &str) -> Result<ObjectUrl> {
        let token: [u8; 8] = rand::random();
        let name = if extension.is_empty() {
            hex::encode(token)
        } else {
            format!("{}.{}", hex::encode(token), extension)
        };
        let path = self.dir.path().join(name);
        fs::write(&path, bytes)
            .with_context(|| format!("preview: write {}", path.display()))?;
        let url = Url::from_file_path(&path)
            .map_err(|_| anyhow!("preview: {} is not an absolute path", path.display()))?
            .to_string();
        self.live.insert(url.clone());
        debug!(%url, "object url created");
        Ok(ObjectUrl { url, path })
    }

    /// Releases the URL; returns false when it was not live.
    pub fn revoke(&mut self, object: &ObjectUrl) -> bool {
        if !self.live.remove(&object.url) {
            return false;
        }
        let _ = fs::remove_file(&object.path);
        debug!(url = %object.url, "object url revoked");
        true
    }

    pub fn is_live(&self, object: &ObjectUrl) -> bool {
        self.live.contains(&object.url) && object.path.exists()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
