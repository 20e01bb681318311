//! Media path resolution.
//!
//! The narrow contract to the out-of-scope library subsystem: turning a
//! media identity into a readable source path. The filesystem resolver
//! treats ids as media-root-relative paths; a real catalog supplies its
//! own implementation.

use std::path::{Component, Path, PathBuf};

use crate::models::MediaId;
use crate::{Error, Result};

pub trait MediaResolver: Send + Sync {
    fn resolve(&self, media_id: &MediaId) -> Result<PathBuf>;
}

/// Resolves media ids as paths relative to a media root.
pub struct FsMediaResolver {
    root: PathBuf,
}

impl FsMediaResolver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MediaResolver for FsMediaResolver {
    fn resolve(&self, media_id: &MediaId) -> Result<PathBuf> {
        let relative = Path::new(media_id.as_str());
        let traversal = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if traversal || media_id.as_str().is_empty() {
            return Err(Error::Validation(format!("invalid media id: {media_id}")));
        }

        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(Error::NotFound(format!("media file {media_id} not found")));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_relative_ids() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("shows")).expect("subdir");
        std::fs::write(dir.path().join("shows/e01.mkv"), b"x").expect("file");

        let resolver = FsMediaResolver::new(dir.path());
        let path = resolver
            .resolve(&MediaId::from("shows/e01.mkv"))
            .expect("resolve");
        assert!(path.is_file());
    }

    #[test]
    fn rejects_traversal_and_absolute_ids() {
        let dir = TempDir::new().expect("tempdir");
        let resolver = FsMediaResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve(&MediaId::from("../etc/passwd")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            resolver.resolve(&MediaId::from("/etc/passwd")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let resolver = FsMediaResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve(&MediaId::from("nope.mkv")),
            Err(Error::NotFound(_))
        ));
    }
}
