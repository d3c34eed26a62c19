//! # Jedi Process
//!
//! Low-level Unix primitives used by the native backend:
//! - privileged spawn with identity drop and stdio redirection
//! - blocking wait with outcome classification
//! - signal delivery and existence checks
//! - file mode and ownership changes

#[cfg(unix)]
pub mod check;
#[cfg(unix)]
pub mod execute;
#[cfg(unix)]
pub mod file_ops;
#[cfg(unix)]
pub mod terminate;
pub mod validation;

#[cfg(unix)]
pub use check::*;
#[cfg(unix)]
pub use execute::*;
#[cfg(unix)]
pub use file_ops::*;
#[cfg(unix)]
pub use terminate::*;
pub use validation::*;
