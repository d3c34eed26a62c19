//! Capability surface shared by every backend.

use std::path::Path;

use jedi_common::{ExecRequest, RuntimeResult};

use crate::facade::Process;

/// A strategy for launching and controlling OS processes.
///
/// Every exec variant (plain, with uid, with uid and gid, with
/// redirections) is one [`ExecRequest`]. Operations a backend cannot
/// perform return [`jedi_common::RuntimeError::Unsupported`].
pub trait Backend: Send + Sync {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &'static str;

    fn exec(&self, request: ExecRequest) -> RuntimeResult<Process>;

    fn chmod(&self, path: &Path, mode: u32) -> RuntimeResult<()>;

    /// Change the owner of `path`, and its group when `gid` is given.
    fn chown(&self, path: &Path, uid: u32, gid: Option<u32>) -> RuntimeResult<()>;

    fn chgrp(&self, path: &Path, gid: u32) -> RuntimeResult<()>;

    fn kill_process(&self, pid: u32) -> RuntimeResult<()>;

    fn signal_process(&self, pid: u32, signal: i32) -> RuntimeResult<()>;

    /// Run a whitespace-tokenized command line to completion and return its
    /// exit status.
    fn system(&self, command: &str) -> RuntimeResult<i32>;
}
