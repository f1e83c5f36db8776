//! Manifest model (spec §3, §4.2): the line-oriented text format tracking
//! which file version each path belongs to and which bundle owns it.

mod parse;
mod write;

pub use parse::parse;
pub use write::write_atomic;

use camino::Utf8PathBuf;

use crate::flags::Flags;
use crate::hash::Hashval;

/// One path inside one manifest (or, inside the distinguished `MoM`
/// manifest, one bundle name).
#[derive(Clone, Debug)]
pub struct FileRecord {
	pub flags: Flags,
	pub hash: Hashval,
	pub version: u32,
	pub path: Utf8PathBuf,

	/// In-memory only: populated during the chroot walk, never written.
	pub size: Option<u64>,
	/// In-memory only: index of the paired record in the *other* version's
	/// manifest, set by peer-linking for "changed" pairs (spec §4.3).
	pub old_peer_index: Option<usize>,
	/// In-memory only: index of the paired record within *this* manifest's
	/// own file list, set by rename detection (spec §4.5).
	pub rename_peer_index: Option<usize>,
}

impl FileRecord {
	pub fn new(path: Utf8PathBuf, hash: Hashval, version: u32, flags: Flags) -> Self {
		Self { flags, hash, version, path, size: None, old_peer_index: None, rename_peer_index: None }
	}

	pub fn is_deleted(&self) -> bool {
		self.flags.status.is_deleted_like()
	}
}

#[derive(Clone, Debug, Default)]
pub struct Header {
	pub format: u32,
	pub version: u32,
	pub previous: u32,
	pub minversion: u32,
	pub filecount: u32,
	pub timestamp: i64,
	pub contentsize: u64,
	pub includes: Vec<String>,
	pub also_add: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Manifest {
	pub header: Header,
	pub files: Vec<FileRecord>,
}

impl Manifest {
	/// Name used for the `MANIFEST` line of the MoM itself, and for the
	/// file on disk (`Manifest.MoM`).
	pub const MOM_NAME: &'static str = "MoM";

	pub fn new(header: Header, files: Vec<FileRecord>) -> Self {
		Self { header, files }
	}

	/// Sorts the file list lexicographically by path (spec §3 invariant,
	/// re-established after peer-linking per §4.3).
	pub fn sort_by_path(&mut self) {
		self.files.sort_by(|a, b| a.path.cmp(&b.path));
	}

	/// Sorts the file list by (version ascending, path ascending), the
	/// order manifests are actually serialized in (spec §4.3).
	pub fn sort_for_write(&mut self) {
		self.files.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::flags::Flags;

	#[test]
	fn sort_for_write_orders_by_version_then_path() {
		let mk = |p: &str, v: u32| FileRecord::new(Utf8PathBuf::from(p), Hashval::ZERO, v, Flags::unset());
		let mut m = Manifest::new(Header::default(), vec![mk("/b", 2), mk("/a", 1), mk("/c", 1)]);
		m.sort_for_write();
		let paths: Vec<_> = m.files.iter().map(|f| (f.version, f.path.as_str())).collect();
		assert_eq!(paths, vec![(1, "/a"), (1, "/c"), (2, "/b")]);
	}
}
