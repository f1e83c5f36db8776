//! Delta generation and validation (spec §4.9): per-file binary diffs
//! produced by an external `bsdiff`, validated by round-trip through
//! `bspatch`.

use std::fs;
use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::diff::MIN_DELTA_BYTES;
use crate::error::{Error, Result};
use crate::external::run_with_timeout;
use crate::flags::FileType;
use crate::hash::{hash_path, HashRegistry};
use crate::manifest::{FileRecord, Manifest};

/// Wall-clock budget for a single `bsdiff`/`bspatch` invocation (spec §4.9,
/// §5).
const DELTA_TIMEOUT: Duration = Duration::from_secs(480);

const EXCLUDED_PREFIXES: &[&str] = &["/usr/bin/", "/usr/lib64/"];

#[derive(Clone, Debug)]
pub struct Delta {
	pub path: Utf8PathBuf,
	pub from_version: u32,
	pub to_version: u32,
	pub from_hash: String,
	pub to_hash: String,
	pub error: Option<String>,
}

/// A candidate pair eligible for delta generation, joined by path between
/// an old and new manifest (spec §4.9's eligibility rule).
struct Candidate<'a> {
	path: &'a Utf8Path,
	old: &'a FileRecord,
	new: &'a FileRecord,
}

fn eligible_candidates<'a>(old: &'a Manifest, new: &'a Manifest) -> Vec<Candidate<'a>> {
	let mut out = Vec::new();
	let mut oi = 0usize;
	let mut ni = 0usize;
	while oi < old.files.len() && ni < new.files.len() {
		match old.files[oi].path.cmp(&new.files[ni].path) {
			std::cmp::Ordering::Equal => {
				let (o, n) = (&old.files[oi], &new.files[ni]);
				if o.flags.file_type == FileType::Regular
					&& n.flags.file_type == FileType::Regular
					&& o.hash != n.hash
					&& n.version > o.version
					&& n.size.unwrap_or(0) >= MIN_DELTA_BYTES
					&& !EXCLUDED_PREFIXES.iter().any(|p| n.path.as_str().starts_with(p))
				{
					out.push(Candidate { path: &n.path, old: o, new: n });
				}
				oi += 1;
				ni += 1;
			}
			std::cmp::Ordering::Less => oi += 1,
			std::cmp::Ordering::Greater => ni += 1,
		}
	}
	out
}

fn delta_file_path(out_dir: &Utf8Path, to_version: u32, from_v: u32, to_v: u32, from_h: &str, to_h: &str) -> Utf8PathBuf {
	out_dir.join(to_version.to_string()).join("delta").join(format!("{from_v}-{to_v}-{from_h}-{to_h}"))
}

fn create_one(cand: &Candidate, old_root: &Utf8Path, new_root: &Utf8Path, out_dir: &Utf8Path, registry: &HashRegistry, compressed_fullfile_size: Option<u64>) -> Delta {
	let from_hash = registry.hex(cand.old.hash);
	let to_hash = registry.hex(cand.new.hash);
	let delta_path = delta_file_path(out_dir, cand.new.version, cand.old.version, cand.new.version, &from_hash, &to_hash);

	let mut delta = Delta { path: delta_path.clone(), from_version: cand.old.version, to_version: cand.new.version, from_hash, to_hash, error: None };

	if delta_path.exists() {
		return delta;
	}

	if let Some(parent) = delta_path.parent() {
		if let Err(e) = fs::create_dir_all(parent.as_std_path()) {
			delta.error = Some(format!("failed to create delta dir: {e}"));
			return delta;
		}
	}

	let old_abs = old_root.join(cand.path.strip_prefix("/").unwrap_or(cand.path));
	let new_abs = new_root.join(cand.path.strip_prefix("/").unwrap_or(cand.path));

	let mut bsdiff = Command::new("bsdiff");
	bsdiff.arg(old_abs.as_std_path()).arg(new_abs.as_std_path()).arg(delta_path.as_std_path());

	match run_with_timeout(&mut bsdiff, DELTA_TIMEOUT) {
		Ok(out) if out.code == Some(1) => {
			let _ = fs::remove_file(delta_path.as_std_path());
			delta.error = Some("bsdiff declined to produce a delta (FULLDL)".to_string());
			return delta;
		}
		Ok(out) if !out.success => {
			let _ = fs::remove_file(delta_path.as_std_path());
			delta.error = Some(format!("bsdiff failed: {}", String::from_utf8_lossy(&out.stderr)));
			return delta;
		}
		Ok(_) => {}
		Err(Error::Timeout(d)) => {
			let _ = fs::remove_file(delta_path.as_std_path());
			delta.error = Some(format!("bsdiff timed out after {d:?}"));
			return delta;
		}
		Err(e) => {
			let _ = fs::remove_file(delta_path.as_std_path());
			delta.error = Some(format!("bsdiff could not run: {e}"));
			return delta;
		}
	}

	if let Some(fullfile_size) = compressed_fullfile_size {
		match fs::metadata(delta_path.as_std_path()) {
			Ok(meta) if meta.len() >= fullfile_size => {
				let _ = fs::remove_file(delta_path.as_std_path());
				delta.error = Some("delta not smaller than compressed fullfile".to_string());
				return delta;
			}
			Err(e) => {
				delta.error = Some(format!("failed to stat delta: {e}"));
				return delta;
			}
			_ => {}
		}
	}

	if let Err(e) = verify_round_trip(&old_abs, &delta_path, &delta.to_hash) {
		let _ = fs::remove_file(delta_path.as_std_path());
		delta.error = Some(e.to_string());
	}

	delta
}

fn verify_round_trip(old_abs: &Utf8Path, delta_path: &Utf8Path, expected_to_hash: &str) -> Result<()> {
	let test_path = delta_path.with_extension("test");
	let mut bspatch = Command::new("bspatch");
	bspatch.arg(old_abs.as_std_path()).arg(test_path.as_std_path()).arg(delta_path.as_std_path());

	let out = run_with_timeout(&mut bspatch, DELTA_TIMEOUT)?;
	if !out.success {
		let _ = fs::remove_file(test_path.as_std_path());
		return Err(Error::ExternalCommandFailed(format!("bspatch failed: {}", String::from_utf8_lossy(&out.stderr))));
	}

	let actual = hash_path(test_path.as_std_path())?;
	let _ = fs::remove_file(test_path.as_std_path());

	if actual != expected_to_hash {
		return Err(Error::HashMismatch { expected: expected_to_hash.to_string(), actual });
	}
	Ok(())
}

/// Generates deltas for every path eligible between `old` and `new` (spec
/// §4.9). Per-delta failures are reported on the returned `Delta.error`
/// rather than aborting the batch.
pub fn generate_deltas(
	old: &Manifest,
	new: &Manifest,
	old_root: &Utf8Path,
	new_root: &Utf8Path,
	out_dir: &Utf8Path,
	fullfiles_dir: &Utf8Path,
	registry: &HashRegistry,
	workers: usize,
) -> Result<Vec<Delta>> {
	let candidates = eligible_candidates(old, new);

	let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;

	let deltas: Vec<Delta> = pool.install(|| {
		candidates
			.par_iter()
			.map(|c| {
				let to_hash = registry.hex(c.new.hash);
				let fullfile_size = fullfile_size_on_disk(fullfiles_dir, &to_hash);
				create_one(c, old_root, new_root, out_dir, registry, fullfile_size)
			})
			.collect()
	});

	let failed = deltas.iter().filter(|d| d.error.is_some()).count();
	info!(total = deltas.len(), failed, "deltas generated");
	for d in deltas.iter().filter(|d| d.error.is_some()) {
		warn!(from = d.from_hash, to = d.to_hash, error = ?d.error, "delta generation failed");
	}

	Ok(deltas)
}

/// Used by [`generate_deltas`]'s caller to supply the compressed-fullfile
/// size threshold once it's known (fullfiles are generated separately;
/// spec §4.9 step 3 compares against the fullfile produced in §4.8).
pub fn fullfile_size_on_disk(out_dir: &Utf8Path, to_hash: &str) -> Option<u64> {
	fs::metadata(out_dir.join(format!("{to_hash}.tar")).as_std_path()).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::flags::Flags;
	use crate::manifest::Header;

	fn rec(path: &str, hash: crate::hash::Hashval, version: u32, size: u64) -> FileRecord {
		let mut f = FileRecord::new(Utf8PathBuf::from(path), hash, version, Flags { file_type: FileType::Regular, ..Flags::unset() });
		f.size = Some(size);
		f
	}

	#[test]
	fn excludes_usr_bin_and_usr_lib64_from_candidates() {
		let registry = HashRegistry::new();
		let h1 = registry.intern(&"a".repeat(64)).unwrap();
		let h2 = registry.intern(&"b".repeat(64)).unwrap();
		let old = Manifest::new(Header::default(), vec![rec("/usr/bin/foo", h1, 10, 1000)]);
		let new = Manifest::new(Header::default(), vec![rec("/usr/bin/foo", h2, 20, 1000)]);
		assert!(eligible_candidates(&old, &new).is_empty());
	}

	#[test]
	fn requires_version_increase_and_hash_change() {
		let registry = HashRegistry::new();
		let h1 = registry.intern(&"a".repeat(64)).unwrap();
		let old = Manifest::new(Header::default(), vec![rec("/foo", h1, 10, 1000)]);
		let new = Manifest::new(Header::default(), vec![rec("/foo", h1, 20, 1000)]);
		assert!(eligible_candidates(&old, &new).is_empty(), "identical hash must not produce a delta candidate");
	}

	#[test]
	fn requires_minimum_size() {
		let registry = HashRegistry::new();
		let h1 = registry.intern(&"a".repeat(64)).unwrap();
		let h2 = registry.intern(&"b".repeat(64)).unwrap();
		let old = Manifest::new(Header::default(), vec![rec("/foo", h1, 10, 50)]);
		let new = Manifest::new(Header::default(), vec![rec("/foo", h2, 20, 50)]);
		assert!(eligible_candidates(&old, &new).is_empty());
	}
}
