//! Peer-linking: the two-pointer merge walk deciding, per path, whether a
//! file is unchanged, changed, added, or deleted (spec §4.3).

use std::cmp::Ordering;

use crate::flags::Flags;
use crate::hash::Hashval;
use crate::manifest::FileRecord;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerLinkStats {
	pub changed: u32,
	pub added: u32,
	pub removed: u32,
}

impl PeerLinkStats {
	pub fn any_change(&self) -> bool {
		self.changed > 0 || self.added > 0 || self.removed > 0
	}
}

/// Merges a freshly-scanned, present-only file list (`new_files`, sorted by
/// path) against the previous version's full file list (`old_files`,
/// sorted by path, including deleted/ghosted entries), assigning each
/// output record its version stamp.
///
/// `new_files[i].old_peer_index` is set to the index of its paired record
/// within `old_files` for "changed" pairs - both sides name the same path,
/// so delta generation can join on path directly, but the index is kept for
/// uniformity with rename-linked pairs (spec §4.5) which cannot.
///
/// Returns the merged, path-sorted output list plus per-bundle counters
/// used to decide whether the bundle changed at all (spec §4.3 step 7).
pub fn link_peers(new_files: Vec<FileRecord>, old_files: &[FileRecord], version: u32, minversion: u32) -> (Vec<FileRecord>, PeerLinkStats) {
	let mut new_files = new_files;
	new_files.sort_by(|a, b| a.path.cmp(&b.path));

	let mut out = Vec::with_capacity(new_files.len() + old_files.len());
	let mut stats = PeerLinkStats::default();
	let mut i = 0usize;
	let mut j = 0usize;

	while i < new_files.len() && j < old_files.len() {
		match new_files[i].path.cmp(&old_files[j].path) {
			Ordering::Equal => {
				if old_files[j].flags.status.is_deleted_like() {
					// same path resurrected: treat the revival as a fresh add
					let mut f = new_files[i].clone();
					f.version = version;
					out.push(f);
					stats.added += 1;
				} else if new_files[i].hash == old_files[j].hash && old_files[j].version >= minversion {
					let mut f = new_files[i].clone();
					f.version = old_files[j].version;
					out.push(f);
				} else {
					let mut f = new_files[i].clone();
					f.version = version;
					f.old_peer_index = Some(j);
					out.push(f);
					stats.changed += 1;
				}
				i += 1;
				j += 1;
			}
			Ordering::Less => {
				let mut f = new_files[i].clone();
				f.version = version;
				out.push(f);
				stats.added += 1;
				i += 1;
			}
			Ordering::Greater => {
				push_old_only(&old_files[j], version, minversion, &mut out, &mut stats);
				j += 1;
			}
		}
	}

	while i < new_files.len() {
		let mut f = new_files[i].clone();
		f.version = version;
		out.push(f);
		stats.added += 1;
		i += 1;
	}

	while j < old_files.len() {
		push_old_only(&old_files[j], version, minversion, &mut out, &mut stats);
		j += 1;
	}

	out.sort_by(|a, b| a.path.cmp(&b.path));
	(out, stats)
}

fn push_old_only(old: &FileRecord, version: u32, minversion: u32, out: &mut Vec<FileRecord>, stats: &mut PeerLinkStats) {
	if !old.flags.status.is_deleted_like() {
		let mut f = old.clone();
		// hash is kept (not zeroed) so rename detection can still pair this
		// deletion against a newly-added file by content; whatever's left
		// unpaired after that pass gets its hash zeroed there instead.
		f.flags = Flags::deleted();
		f.version = version;
		out.push(f);
		stats.removed += 1;
	} else if old.version >= minversion {
		out.push(old.clone());
	}
	// else: a stale deleted/ghosted record below minversion is dropped entirely
}

#[cfg(test)]
mod tests {
	use camino::Utf8PathBuf;

	use super::*;

	fn present(path: &str, hash: u8, version: u32) -> FileRecord {
		let mut f = FileRecord::new(Utf8PathBuf::from(path), Hashval::ZERO, version, Flags::unset());
		f.flags.file_type = crate::flags::FileType::Regular;
		// stash a fake distinguishing value in `size` since Hashval::ZERO can't vary here
		f.size = Some(hash as u64);
		f
	}

	fn eq_hash(a: &FileRecord, b: &FileRecord) -> bool {
		a.size == b.size
	}

	#[test]
	fn unchanged_file_inherits_old_version() {
		let old = vec![present("/foo", 1, 10)];
		let new = vec![present("/foo", 1, 10)];
		// hash equality in real code is on `.hash`; here we fake it via manual override below
		let mut new = new;
		new[0].hash = old[0].hash;
		let (out, stats) = link_peers(new, &old, 20, 0);
		assert_eq!(out[0].version, 10);
		assert_eq!(stats.changed, 0);
		assert_eq!(stats.added, 0);
		let _ = eq_hash; // silence unused helper warning if hash faking path unused elsewhere
	}

	#[test]
	fn added_file_gets_current_version() {
		let old: Vec<FileRecord> = vec![];
		let new = vec![present("/foo", 1, 0)];
		let (out, stats) = link_peers(new, &old, 20, 0);
		assert_eq!(out[0].version, 20);
		assert_eq!(stats.added, 1);
	}

	#[test]
	fn removed_file_becomes_deleted_record() {
		let old = vec![present("/foo", 1, 10)];
		let new: Vec<FileRecord> = vec![];
		let (out, stats) = link_peers(new, &old, 20, 0);
		assert_eq!(out.len(), 1);
		assert!(out[0].is_deleted());
		// hash survives link_peers alone so rename detection can still pair
		// it by content; only an unpaired leftover gets zeroed there.
		assert_eq!(out[0].size, old[0].size);
		assert_eq!(out[0].version, 20);
		assert_eq!(stats.removed, 1);
	}

	#[test]
	fn deleted_record_below_minversion_is_dropped() {
		let mut old = present("/foo", 1, 10);
		old.flags.status = crate::flags::Status::Deleted;
		let (out, _) = link_peers(vec![], &[old], 20, 15);
		assert!(out.is_empty());
	}

	#[test]
	fn deleted_record_at_or_above_minversion_is_carried_forward() {
		let mut old = present("/foo", 1, 10);
		old.flags.status = crate::flags::Status::Deleted;
		let (out, _) = link_peers(vec![], &[old], 20, 5);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].version, 10);
	}
}
