//! Shared helpers for invoking external tools (`bsdiff`, `bspatch`, the
//! fullfile compressors): process spawning with a wall-clock timeout.
//!
//! Grounded on the teacher's `reporting::AutoSpin`, which spawns a polling
//! thread alongside the work it watches; here the polling thread watches a
//! child process's exit status instead of driving a spinner.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};

/// Outcome of running an external command to completion within budget.
pub struct CommandOutput {
	pub success: bool,
	pub code: Option<i32>,
	pub stderr: Vec<u8>,
}

/// Runs `cmd` to completion, polling every 100ms so the wait can be
/// abandoned once `timeout` elapses (spec §4.9's 480s bsdiff/bspatch
/// budget, spec §5's "each external delta command runs under an 8-minute
/// wall clock").
///
/// A timed-out child is killed; its slot in the filesystem (if any partial
/// output was written) is the caller's responsibility to clean up.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput> {
	let mut child = cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped()).spawn().map_err(|e| Error::ExternalCommandFailed(format!("failed to spawn: {e}")))?;

	let start = Instant::now();
	loop {
		match child.try_wait() {
			Ok(Some(status)) => {
				let mut stderr = Vec::new();
				if let Some(mut s) = child.stderr.take() {
					use std::io::Read;
					let _ = s.read_to_end(&mut stderr);
				}
				return Ok(CommandOutput { success: status.success(), code: status.code(), stderr });
			}
			Ok(None) => {
				if start.elapsed() >= timeout {
					let _ = child.kill();
					let _ = child.wait();
					return Err(Error::Timeout(timeout));
				}
				std::thread::sleep(Duration::from_millis(100));
			}
			Err(e) => return Err(Error::ExternalCommandFailed(format!("failed to wait on child: {e}"))),
		}
	}
}

/// Runs one of several candidate compressor binaries and returns the
/// stdout bytes of whichever succeeds first to write `src` compressed,
/// or `None` if every candidate failed to run (spec §4.8: a missing
/// compressor falls back to uncompressed, with a warning).
pub fn try_compress(name: &str, args: &[&str], src: &Path) -> Option<Vec<u8>> {
	let mut cmd = Command::new(name);
	cmd.args(args).arg(src);
	match cmd.stdin(Stdio::null()).stderr(Stdio::null()).output() {
		Ok(out) if out.status.success() => Some(out.stdout),
		Ok(out) => {
			warn!(compressor = name, code = ?out.status.code(), "compressor exited non-zero");
			None
		}
		Err(e) => {
			warn!(compressor = name, error = %e, "compressor failed to start");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn true_command_succeeds_within_timeout() {
		let mut cmd = Command::new("true");
		let out = run_with_timeout(&mut cmd, Duration::from_secs(5)).unwrap();
		assert!(out.success);
	}

	#[test]
	fn false_command_reports_failure_not_timeout() {
		let mut cmd = Command::new("false");
		let out = run_with_timeout(&mut cmd, Duration::from_secs(5)).unwrap();
		assert!(!out.success);
		assert_eq!(out.code, Some(1));
	}

	#[test]
	fn slow_command_times_out() {
		let mut cmd = Command::new("sleep");
		cmd.arg("5");
		let res = run_with_timeout(&mut cmd, Duration::from_millis(200));
		assert!(matches!(res, Err(Error::Timeout(_))));
	}
}
