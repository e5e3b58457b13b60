//! Path resolution.
//!
//! The resolver normalizes the path (collapsing separators and resolving
//! `.`/`..` itself, so filesystems never see them), picks the owning
//! mount by longest prefix, and walks the remaining components through
//! the filesystem's `lookup` operation.

use std::sync::Arc;

use crate::errors::{GeofsError, GeofsResult};
use crate::path;

use super::{Inode, MountTable};

/// Resolve an absolute path to its inode.
pub(crate) fn resolve(mounts: &MountTable, raw: &str) -> GeofsResult<Arc<Inode>> {
    let normalized = path::normalize(raw)?;
    let (sb, rel) = mounts.resolve_mount(&normalized)?;

    let mut cursor = sb.root;
    for component in path::components(&rel) {
        let ops = cursor.inode_ops.clone();
        cursor = ops.lookup(&cursor, component)?;
    }
    Ok(cursor)
}

/// Resolve the parent directory of `raw` and return it with the final
/// component. The root has no parent.
pub(crate) fn resolve_parent(
    mounts: &MountTable,
    raw: &str,
) -> GeofsResult<(Arc<Inode>, String)> {
    let normalized = path::normalize(raw)?;
    if normalized == "/" {
        return Err(GeofsError::invalid("the root has no parent"));
    }
    let parent = path::parent(&normalized).expect("non-root path has a parent");
    let name = path::file_name(&normalized)
        .expect("non-root path has a final component")
        .to_string();

    // The final component must belong to the same mount as its parent;
    // otherwise the caller is addressing a mount root, which only the
    // mount table may alter.
    let (_, rel) = mounts.resolve_mount(&normalized)?;
    if rel == "/" {
        return Err(GeofsError::invalid(format!(
            "{normalized} is a mount root"
        )));
    }

    let dir = resolve(mounts, parent)?;
    Ok((dir, name))
}
