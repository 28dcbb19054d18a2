use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::primitives::io::StdFileIo;
use crate::primitives::pager::BufferPool;
use crate::storage::attstream::AttrType;
use crate::storage::Relation;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the buffer pool over an existing relation file.
///
/// # Errors
///
/// Returns an error if the file is missing or cannot be opened.
pub fn open_pool(path: &Path, opts: &AdminOpenOptions) -> Result<Arc<BufferPool>> {
    if !path.exists() {
        return Err(AdminError::missing_relation(path));
    }
    let io = StdFileIo::open(path)?;
    Ok(Arc::new(BufferPool::new(
        Arc::new(io),
        opts.store.pool_options(),
    )?))
}

/// Opens the relation at `path`, formatting a new one with `attrs` when the
/// file is missing and `create_if_missing` is set.
pub fn open_relation(path: &Path, opts: &AdminOpenOptions, attrs: &[AttrType]) -> Result<Relation> {
    if !path.exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_relation(path));
        }
        ensure_parent_dir(path)?;
        return Ok(Relation::create_path(path, attrs, opts.store.clone())?);
    }
    let pool = open_pool(path, opts)?;
    Ok(Relation::open(pool, opts.store.clone())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
