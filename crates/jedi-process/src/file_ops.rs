//! File permission and ownership changes.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use jedi_common::{validate_id, RuntimeError, RuntimeResult};
use tracing::debug;

use crate::validation::validate_mode;

/// Set the permission bits of `path`.
pub fn chmod(path: &Path, mode: u32) -> RuntimeResult<()> {
    validate_mode(mode)?;
    debug!("chmod {:o} {}", mode, path.display());
    fs::set_permissions(path, Permissions::from_mode(mode))
        .map_err(|e| RuntimeError::from_io("chmod", path.display().to_string(), e))
}

/// Change the owner of `path`, and its group when `gid` is given.
pub fn chown(path: &Path, uid: u32, gid: Option<u32>) -> RuntimeResult<()> {
    validate_id("uid", uid)?;
    if let Some(gid) = gid {
        validate_id("gid", gid)?;
    }
    debug!("chown {}:{:?} {}", uid, gid, path.display());
    std::os::unix::fs::chown(path, Some(uid), gid)
        .map_err(|e| RuntimeError::from_io("chown", path.display().to_string(), e))
}

/// Change only the group of `path`.
pub fn chgrp(path: &Path, gid: u32) -> RuntimeResult<()> {
    validate_id("gid", gid)?;
    debug!("chgrp {} {}", gid, path.display());
    std::os::unix::fs::chown(path, None, Some(gid))
        .map_err(|e| RuntimeError::from_io("chgrp", path.display().to_string(), e))
}
