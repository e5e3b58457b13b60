//! On-disk layout of a volume root.
//!
//! ```text
//! <root>/
//!   content/<first-2-hex>/<digest-hex>   content blobs
//!   refs/<view-id>/delta                 tagged ref-entry records
//!   refs/<view-id>/hide                  newline-separated hidden paths
//!   views/index                          header + sealed views in order
//!   logs/                                engine log files
//! ```

use std::path::{Path, PathBuf};

use crate::errors::GeofsResult;
use crate::views::ViewId;

/// Path helper for everything under a volume root. Immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    root: PathBuf,
}

impl VolumeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn view_dir(&self, id: ViewId) -> PathBuf {
        self.refs_dir().join(id.0.to_string())
    }

    pub fn delta_path(&self, id: ViewId) -> PathBuf {
        self.view_dir(id).join("delta")
    }

    pub fn hide_path(&self, id: ViewId) -> PathBuf {
        self.view_dir(id).join("hide")
    }

    pub fn views_dir(&self) -> PathBuf {
        self.root.join("views")
    }

    pub fn index_path(&self) -> PathBuf {
        self.views_dir().join("index")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the directory skeleton.
    pub fn prepare(&self) -> GeofsResult<()> {
        std::fs::create_dir_all(self.content_dir())?;
        std::fs::create_dir_all(self.refs_dir())?;
        std::fs::create_dir_all(self.views_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_creates_skeleton() {
        let dir = tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path().join("vol"));
        layout.prepare().unwrap();
        assert!(layout.content_dir().is_dir());
        assert!(layout.refs_dir().is_dir());
        assert!(layout.views_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
    }

    #[test]
    fn test_view_paths() {
        let layout = VolumeLayout::new("/vol");
        assert_eq!(
            layout.delta_path(ViewId(7)),
            PathBuf::from("/vol/refs/7/delta")
        );
        assert_eq!(
            layout.hide_path(ViewId(7)),
            PathBuf::from("/vol/refs/7/hide")
        );
        assert_eq!(layout.index_path(), PathBuf::from("/vol/views/index"));
    }
}
