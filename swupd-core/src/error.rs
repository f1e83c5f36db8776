//! Error taxonomy for the build engine (spec §7).
//!
//! Fatal kinds are meant to abort a batch; non-fatal kinds
//! (`HashMismatch`, `DeltaFullDl`, `Timeout`, `ExternalCommandFailed`) are
//! collected per-result instead (`Delta.error`, `PackInfo.warnings`, ...)
//! and should usually be constructed directly rather than propagated with `?`.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid manifest: {0}")]
	InvalidManifest(String),

	#[error("io error at {path:?}: {source}")]
	Io {
		path: Option<PathBuf>,
		#[source]
		source: std::io::Error,
	},

	#[error("bad chroot: {0}")]
	BadChroot(String),

	#[error("hash mismatch: expected {expected}, got {actual}")]
	HashMismatch { expected: String, actual: String },

	#[error("external diff tool declined to produce a delta (FULLDL)")]
	DeltaFullDl,

	#[error("external command timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("external command failed: {0}")]
	ExternalCommandFailed(String),

	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),

	#[error("minversion ({minversion}) is greater than version ({version})")]
	MinVersionViolation { minversion: u32, version: u32 },

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl Error {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Error::Io { path: Some(path.into()), source }
	}

	/// Human-readable single line prefixed by the operation name, per §7's
	/// "user-visible failure is a single human-readable line" rule.
	pub fn user_line(&self, operation: &str) -> String {
		format!("{operation}: {self}")
	}
}

impl From<std::io::Error> for Error {
	fn from(source: std::io::Error) -> Self {
		Error::Io { path: None, source }
	}
}
