//! Rename detection (spec §4.5): pairs newly-added files with newly-deleted
//! ones that are really the same object at a different path.

use crate::flags::Misc;
use crate::hash::Hashval;
use crate::manifest::FileRecord;

use super::MIN_DELTA_BYTES;

/// Strips decimal digits and `.` from a path's final component, matching
/// paths like `/lib/python3.6/libpython.so` to
/// `/lib/python3.7/libpython.so` (spec §4.5 pass 2).
fn stripped_name(path: &str) -> String {
	path.chars().filter(|c| !c.is_ascii_digit() && *c != '.').collect()
}

/// Links renames between `added` and `removed` indices of `files`, in
/// place. `added`/`removed` are indices into `files` of present newly-added
/// and newly-deleted records respectively (disjoint by construction).
///
/// After linking, any index in `removed` still unpaired has its hash
/// zeroed and type cleared (a plain, unrelated deletion).
pub fn detect_renames(files: &mut [FileRecord], added: &[usize], removed: &[usize]) {
	let mut added_left: Vec<usize> = added.to_vec();
	let mut removed_left: Vec<usize> = removed.to_vec();

	// pass 1: exact hash pairing
	added_left.sort_by_key(|&i| files[i].hash);
	removed_left.sort_by_key(|&i| files[i].hash);

	let mut linked_added = vec![false; added_left.len()];
	let mut linked_removed = vec![false; removed_left.len()];

	let mut ai = 0usize;
	let mut ri = 0usize;
	while ai < added_left.len() && ri < removed_left.len() {
		let a = added_left[ai];
		let r = removed_left[ri];
		match files[a].hash.cmp(&files[r].hash) {
			std::cmp::Ordering::Equal => {
				link_rename(files, a, r);
				linked_added[ai] = true;
				linked_removed[ri] = true;
				ai += 1;
				ri += 1;
			}
			std::cmp::Ordering::Less => ai += 1,
			std::cmp::Ordering::Greater => ri += 1,
		}
	}

	// pass 2: stripped-name pairing over the still-unpaired, non-tiny remainder
	let mut added_rest: Vec<usize> = added_left
		.iter()
		.enumerate()
		.filter(|(idx, &i)| !linked_added[*idx] && files[i].size.unwrap_or(0) > MIN_DELTA_BYTES)
		.map(|(_, &i)| i)
		.collect();
	let mut removed_rest: Vec<usize> = removed_left
		.iter()
		.enumerate()
		.filter(|(idx, &i)| !linked_removed[*idx] && files[i].size.unwrap_or(0) > MIN_DELTA_BYTES)
		.map(|(_, &i)| i)
		.collect();

	added_rest.sort_by(|&a, &b| {
		stripped_name(files[a].path.as_str()).cmp(&stripped_name(files[b].path.as_str())).then_with(|| files[a].path.cmp(&files[b].path))
	});
	removed_rest.sort_by(|&a, &b| {
		stripped_name(files[a].path.as_str()).cmp(&stripped_name(files[b].path.as_str())).then_with(|| files[a].path.cmp(&files[b].path))
	});

	let mut ai = 0usize;
	let mut ri = 0usize;
	while ai < added_rest.len() && ri < removed_rest.len() {
		let a = added_rest[ai];
		let r = removed_rest[ri];
		let sa = stripped_name(files[a].path.as_str());
		let sr = stripped_name(files[r].path.as_str());
		match sa.cmp(&sr) {
			std::cmp::Ordering::Equal => {
				link_rename(files, a, r);
				ai += 1;
				ri += 1;
			}
			std::cmp::Ordering::Less => ai += 1,
			std::cmp::Ordering::Greater => ri += 1,
		}
	}

	// anything left in `removed` with no rename peer is a plain deletion
	for &r in removed {
		if files[r].rename_peer_index.is_none() {
			files[r].hash = Hashval::ZERO;
			files[r].flags.file_type = crate::flags::FileType::Unset;
		}
	}
}

fn link_rename(files: &mut [FileRecord], a: usize, r: usize) {
	files[a].rename_peer_index = Some(r);
	files[r].rename_peer_index = Some(a);
	files[a].flags.misc = Misc::MixOrigin;
	files[r].flags.misc = Misc::MixOrigin;
}

#[cfg(test)]
mod tests {
	use camino::Utf8PathBuf;

	use super::*;
	use crate::flags::{FileType, Flags, Status};

	fn rec(path: &str, hash: Hashval, size: u64, deleted: bool) -> FileRecord {
		let mut f = FileRecord::new(Utf8PathBuf::from(path), hash, 20, Flags::unset());
		f.size = Some(size);
		f.flags.file_type = FileType::Regular;
		if deleted {
			f.flags.status = Status::Deleted;
		}
		f
	}

	#[test]
	fn exact_hash_rename_links_both_sides_symmetrically() {
		let registry = crate::hash::HashRegistry::new();
		let h = registry.intern(&"c".repeat(64)).unwrap();
		let mut files = vec![rec("/lib/py3.6/lib.so", h, 5000, true), rec("/lib/py3.7/lib.so", h, 5000, false)];
		detect_renames(&mut files, &[1], &[0]);
		assert_eq!(files[0].rename_peer_index, Some(1));
		assert_eq!(files[1].rename_peer_index, Some(0));
		assert_eq!(files[0].flags.misc, Misc::MixOrigin);
		assert_eq!(files[1].flags.misc, Misc::MixOrigin);
	}

	#[test]
	fn stripped_name_pairs_version_bumped_paths() {
		let registry = crate::hash::HashRegistry::new();
		let h_old = registry.intern(&"a".repeat(64)).unwrap();
		let h_new = registry.intern(&"b".repeat(64)).unwrap();
		let mut files = vec![rec("/lib/python3.6/libpython.so", h_old, 5000, true), rec("/lib/python3.7/libpython.so", h_new, 5000, false)];
		detect_renames(&mut files, &[1], &[0]);
		assert_eq!(files[0].rename_peer_index, Some(1));
	}

	#[test]
	fn tiny_files_are_excluded_from_stripped_name_pass() {
		let registry = crate::hash::HashRegistry::new();
		let h_old = registry.intern(&"a".repeat(64)).unwrap();
		let h_new = registry.intern(&"b".repeat(64)).unwrap();
		let mut files = vec![rec("/etc/foo.1", h_old, 10, true), rec("/etc/foo.2", h_new, 10, false)];
		detect_renames(&mut files, &[1], &[0]);
		assert_eq!(files[0].rename_peer_index, None);
		assert_eq!(files[0].hash, Hashval::ZERO);
	}

	#[test]
	fn unpaired_deletion_is_zeroed() {
		let mut files = vec![rec("/gone", Hashval::ZERO, 1000, true)];
		files[0].hash = crate::hash::HashRegistry::new().intern(&"d".repeat(64)).unwrap();
		detect_renames(&mut files, &[], &[0]);
		assert_eq!(files[0].hash, Hashval::ZERO);
		assert_eq!(files[0].flags.file_type, FileType::Unset);
	}
}
