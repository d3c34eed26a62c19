//! Request model for process execution.
//!
//! An [`ExecRequest`] collapses every combination of "command, identity
//! override, stdio redirection" into one value. Backends take the request by
//! value and never mutate it after the process is constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{RuntimeError, RuntimeResult};

/// Raw platform sentinel meaning "keep the caller's identity".
pub const UNSET_ID: i32 = -1;

/// Reject ids that collide with the [`UNSET_ID`] sentinel.
///
/// `u32::MAX` is the bit pattern of `-1` and is never a valid override.
pub fn validate_id(kind: &str, id: u32) -> RuntimeResult<()> {
    if id == UNSET_ID as u32 {
        return Err(RuntimeError::invalid_argument(format!(
            "{} {} collides with the unset sentinel",
            kind, id
        )));
    }
    Ok(())
}

/// Program plus arguments, in order.
///
/// ```
/// use jedi_common::Command;
///
/// let cmd = Command::parse("ls  -l\t/tmp");
/// assert_eq!(cmd.args(), ["ls", "-l", "/tmp"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command(Vec<String>);

impl Command {
    /// Creates a command from an ordered argument list.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    /// Tokenizes a single command line on ASCII whitespace.
    ///
    /// There is no quoting or escaping; arguments containing spaces need
    /// [`Command::new`].
    pub fn parse(line: &str) -> Self {
        Self(line.split_ascii_whitespace().map(str::to_string).collect())
    }

    /// The executable name (first argument), if any.
    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Self::parse(line)
    }
}

impl From<Vec<String>> for Command {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl From<&[&str]> for Command {
    fn from(args: &[&str]) -> Self {
        Self::new(args.iter().copied())
    }
}

/// One of the three standard streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdStream::Stdin => write!(f, "stdin"),
            StdStream::Stdout => write!(f, "stdout"),
            StdStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Where a standard stream of the child is connected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioTarget {
    /// Whatever the backend wires by default (a live pipe for host processes).
    #[default]
    Inherit,
    /// A filesystem path. Parent directories are never created.
    Path(PathBuf),
}

impl StdioTarget {
    pub fn path(&self) -> Option<&Path> {
        match self {
            StdioTarget::Inherit => None,
            StdioTarget::Path(p) => Some(p),
        }
    }
}

/// Redirection targets for the three standard streams.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Redirections {
    #[serde(default)]
    pub stdout: StdioTarget,
    #[serde(default)]
    pub stderr: StdioTarget,
    #[serde(default)]
    pub stdin: StdioTarget,
}

impl Redirections {
    pub fn get(&self, stream: StdStream) -> &StdioTarget {
        match stream {
            StdStream::Stdin => &self.stdin,
            StdStream::Stdout => &self.stdout,
            StdStream::Stderr => &self.stderr,
        }
    }

    /// True when at least one stream goes to a file.
    pub fn any_file(&self) -> bool {
        [&self.stdout, &self.stderr, &self.stdin]
            .iter()
            .any(|t| t.path().is_some())
    }
}

/// Requested identity for the child. `None` keeps the caller's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Identity {
    /// Builds an identity from raw platform ints, where [`UNSET_ID`] means
    /// "not overridden".
    pub fn from_raw(uid: i32, gid: i32) -> RuntimeResult<Self> {
        fn convert(kind: &str, raw: i32) -> RuntimeResult<Option<u32>> {
            match raw {
                UNSET_ID => Ok(None),
                r if r < 0 => Err(RuntimeError::invalid_argument(format!(
                    "{} {} is negative",
                    kind, r
                ))),
                r => Ok(Some(r as u32)),
            }
        }
        Ok(Self {
            uid: convert("uid", uid)?,
            gid: convert("gid", gid)?,
        })
    }

    pub fn is_override(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }
}

/// A complete execution request: command, identity override, redirections.
///
/// ```
/// use jedi_common::{ExecRequest, StdioTarget};
///
/// let request = ExecRequest::new(["sh", "-c", "echo hi"])
///     .uid(1000)
///     .stdout_to("/tmp/out.txt");
/// assert_eq!(request.identity.uid, Some(1000));
/// assert!(matches!(request.redirections.stdout, StdioTarget::Path(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Command,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub redirections: Redirections,
}

impl ExecRequest {
    pub fn new(command: impl Into<CommandInput>) -> Self {
        Self {
            command: command.into().0,
            identity: Identity::default(),
            redirections: Redirections::default(),
        }
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.identity.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.identity.gid = Some(gid);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirections.stdout = StdioTarget::Path(path.into());
        self
    }

    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirections.stderr = StdioTarget::Path(path.into());
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirections.stdin = StdioTarget::Path(path.into());
        self
    }

    pub fn redirections(mut self, redirections: Redirections) -> Self {
        self.redirections = redirections;
        self
    }

    /// Checks the id preconditions. Command emptiness is not an argument
    /// error: it is recorded as an exec failure on the process itself.
    pub fn validate(&self) -> RuntimeResult<()> {
        if let Some(uid) = self.identity.uid {
            validate_id("uid", uid)?;
        }
        if let Some(gid) = self.identity.gid {
            validate_id("gid", gid)?;
        }
        Ok(())
    }
}

/// Anything that can name a command: a [`Command`], a whitespace-separated
/// line, or an argument list.
pub struct CommandInput(Command);

impl From<Command> for CommandInput {
    fn from(cmd: Command) -> Self {
        Self(cmd)
    }
}

impl From<&str> for CommandInput {
    fn from(line: &str) -> Self {
        Self(Command::parse(line))
    }
}

impl From<String> for CommandInput {
    fn from(line: String) -> Self {
        Self(Command::parse(&line))
    }
}

impl From<Vec<String>> for CommandInput {
    fn from(args: Vec<String>) -> Self {
        Self(Command::from(args))
    }
}

impl<const N: usize> From<[&str; N]> for CommandInput {
    fn from(args: [&str; N]) -> Self {
        Self(Command::new(args))
    }
}

impl From<&[&str]> for CommandInput {
    fn from(args: &[&str]) -> Self {
        Self(Command::from(args))
    }
}
