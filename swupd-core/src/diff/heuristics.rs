//! Post-link heuristics (spec §4.6): ghosting promotion and optional
//! CPU-capability modifier inference.

use crate::flags::{Modifier, Status};
use crate::manifest::FileRecord;

const GHOST_PREFIXES: &[&str] = &["/boot/", "/usr/lib/modules/", "/usr/lib/kernel/"];

/// Promotes deleted records under kernel-ish paths to `ghosted`, so clients
/// keep the file on disk (e.g. the running kernel) instead of removing it,
/// then applies the CPU-capability modifier decoration.
pub fn apply_heuristics(files: &mut [FileRecord]) {
	for f in files.iter_mut() {
		if f.flags.status == Status::Deleted && GHOST_PREFIXES.iter().any(|p| f.path.as_str().starts_with(p)) {
			f.flags.status = Status::Ghosted;
		}
	}
	infer_cpu_capability(files);
}

/// Optional decoration: infers a CPU-capability modifier (V3/V4/V5) from a
/// path prefix convention, touching only the modifier flag. Never changes
/// hash, status, or version - callers may skip this step entirely with no
/// effect on correctness (spec §4.6).
pub fn infer_cpu_capability(files: &mut [FileRecord]) {
	for f in files.iter_mut() {
		let p = f.path.as_str();
		if p.contains("/glibc-hwcaps/x86-64-v5/") {
			f.flags.modifier = Modifier::CpuV5;
		} else if p.contains("/glibc-hwcaps/x86-64-v4/") {
			f.flags.modifier = Modifier::CpuV4;
		} else if p.contains("/glibc-hwcaps/x86-64-v3/") {
			f.flags.modifier = Modifier::CpuV3;
		}
	}
}

#[cfg(test)]
mod tests {
	use camino::Utf8PathBuf;

	use super::*;
	use crate::flags::Flags;
	use crate::hash::Hashval;

	fn deleted_at(path: &str) -> FileRecord {
		let mut f = FileRecord::new(Utf8PathBuf::from(path), Hashval::ZERO, 20, Flags::unset());
		f.flags.status = Status::Deleted;
		f
	}

	#[test]
	fn promotes_boot_deletions_to_ghosted() {
		let mut files = vec![deleted_at("/boot/vmlinuz-1"), deleted_at("/usr/lib/modules/1/x"), deleted_at("/usr/lib/kernel/y")];
		apply_heuristics(&mut files);
		assert!(files.iter().all(|f| f.flags.status == Status::Ghosted));
	}

	#[test]
	fn leaves_unrelated_deletions_alone() {
		let mut files = vec![deleted_at("/etc/foo")];
		apply_heuristics(&mut files);
		assert_eq!(files[0].flags.status, Status::Deleted);
	}

	#[test]
	fn cpu_capability_inference_only_touches_modifier() {
		let mut f = FileRecord::new(Utf8PathBuf::from("/usr/lib/glibc-hwcaps/x86-64-v3/libc.so"), Hashval::ZERO, 20, Flags::unset());
		let before_hash = f.hash;
		infer_cpu_capability(std::slice::from_mut(&mut f));
		assert_eq!(f.flags.modifier, Modifier::CpuV3);
		assert_eq!(f.hash, before_hash);
	}
}
