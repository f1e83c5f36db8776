//! Chroot directory walking (spec §4.3 step 3): turns a staged bundle root
//! into an initial, path-sorted list of `FileRecord`s. Grounded on the
//! teacher's recursive `diffing.rs::scan_internal` walk, generalized to
//! also capture directories and symlinks (not just regular files) and to
//! compute the spec's HMAC-SHA256 hash instead of a plain content hash.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{Error, Result};
use crate::flags::{FileType, Flags};
use crate::hash::HashRegistry;
use crate::manifest::FileRecord;

/// Characters banned from a basename (spec §6, `BadChroot`): glob/shell
/// metacharacters that would misbehave if interpolated into a client-side
/// command.
const BANNED_BASENAME_CHARS: &[char] = &[';', '&', '|', '*', '<', '>', '"', '\''];

fn check_basename(path: &Utf8Path) -> Result<()> {
	if let Some(name) = path.file_name() {
		if name.chars().any(|c| BANNED_BASENAME_CHARS.contains(&c)) {
			return Err(Error::BadChroot(format!("blacklisted character in filename {path:?}")));
		}
	}
	Ok(())
}

/// Recursively walks `root`, producing one `FileRecord` per entry (file,
/// directory, or symlink) with its path relative to `root` (always
/// absolute from the chroot root, per spec §3) and its content hash.
pub fn walk_chroot(root: &Utf8Path, version: u32, registry: &HashRegistry) -> Result<Vec<FileRecord>> {
	let mut out = Vec::new();
	walk_internal(root, Utf8Path::new(""), version, registry, &mut out)?;
	out.sort_by(|a, b| a.path.cmp(&b.path));
	Ok(out)
}

fn walk_internal(root: &Utf8Path, rel_dir: &Utf8Path, version: u32, registry: &HashRegistry, out: &mut Vec<FileRecord>) -> Result<()> {
	let abs_dir = root.join(rel_dir);
	let entries = std::fs::read_dir(abs_dir.as_std_path()).map_err(|e| Error::io(abs_dir.as_std_path(), e))?;

	for entry in entries {
		let entry = entry.map_err(|e| Error::io(abs_dir.as_std_path(), e))?;
		let entry_path: Utf8PathBuf = entry.path().try_into().map_err(|_| Error::BadChroot(format!("non-UTF-8 path under {abs_dir:?}")))?;
		let rel = entry_path.strip_prefix(root).map_err(|_| Error::BadChroot(format!("{entry_path:?} escaped chroot root")))?.to_path_buf();
		let manifest_path = Utf8PathBuf::from(format!("/{}", rel.as_str().trim_start_matches('/')));
		check_basename(&manifest_path)?;

		let ft = entry.file_type().map_err(|e| Error::io(entry_path.as_std_path(), e))?;
		let hash = registry.hash_and_intern(entry_path.as_std_path())?;

		let file_type = if ft.is_dir() {
			FileType::Directory
		} else if ft.is_symlink() {
			FileType::Link
		} else if ft.is_file() {
			FileType::Regular
		} else {
			return Err(Error::BadChroot(format!("unsupported file type at {entry_path:?}")));
		};

		let mut record = FileRecord::new(manifest_path, hash, version, Flags { file_type, ..Flags::unset() });
		record.size = Some(if ft.is_dir() {
			0
		} else if ft.is_symlink() {
			std::fs::read_link(entry_path.as_std_path()).map_err(|e| Error::io(entry_path.as_std_path(), e))?.as_os_str().len() as u64
		} else {
			entry.metadata().map_err(|e| Error::io(entry_path.as_std_path(), e))?.len()
		});
		out.push(record.clone());

		if ft.is_dir() {
			walk_internal(root, &rel, version, registry, out)?;
		}
	}

	Ok(())
}
