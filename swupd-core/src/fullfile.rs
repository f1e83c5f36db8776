//! Fullfile generation (spec §4.8): one tar archive per distinct hash in
//! `Manifest.full`, optionally compressed by whichever configured external
//! compressor produces the smallest output.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::bounded;
use memmap2::Mmap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::external::try_compress;
use crate::flags::FileType;
use crate::manifest::{FileRecord, Manifest};

/// Compressors attempted for a regular file's fullfile, in the order the
/// spec lists them (spec §4.8). Each entry is (external binary, args,
/// canonical name used in `FullfilesStats`).
const COMPRESSORS: &[(&str, &[&str], &str)] = &[("bzip2", &["-c", "-9"], "bzip2"), ("gzip", &["-c", "-9"], "gzip"), ("xz", &["-c", "-9"], "xz"), ("zstd", &["-c", "-19"], "zstd")];

#[derive(Debug, Default, Clone)]
pub struct FullfilesStats {
	pub skipped: u64,
	pub not_compressed: u64,
	pub per_compressor: std::collections::BTreeMap<String, u64>,
}

impl FullfilesStats {
	fn merge(&mut self, other: FullfilesStats) {
		self.skipped += other.skipped;
		self.not_compressed += other.not_compressed;
		for (k, v) in other.per_compressor {
			*self.per_compressor.entry(k).or_default() += v;
		}
	}
}

/// Builds an uncompressed single-member tar for `record`, whose member name
/// is its content hash and whose payload depends on file type.
fn build_uncompressed_tar(chroot_root: &Utf8Path, record: &FileRecord, hash_hex: &str) -> Result<Vec<u8>> {
	let mut builder = tar::Builder::new(Vec::new());
	let abs_path = chroot_root.join(record.path.strip_prefix("/").unwrap_or(&record.path));

	match record.flags.file_type {
		FileType::Regular => {
			let f = fs::File::open(abs_path.as_std_path()).map_err(|e| Error::io(abs_path.as_std_path(), e))?;
			let len = f.metadata().map_err(|e| Error::io(abs_path.as_std_path(), e))?.len();
			let mut header = tar::Header::new_gnu();
			header.set_size(len);
			header.set_mode(0o644);
			header.set_cksum();
			if len == 0 {
				builder.append_data(&mut header, hash_hex, std::io::empty()).map_err(|e| Error::io(abs_path.as_std_path(), e))?;
			} else {
				// mmap the staged file rather than buffering it through a
				// userspace copy loop, same as the teacher's applying.rs
				let map = unsafe { Mmap::map(&f) }.map_err(|e| Error::io(abs_path.as_std_path(), e))?;
				builder.append_data(&mut header, hash_hex, &map[..]).map_err(|e| Error::io(abs_path.as_std_path(), e))?;
			}
		}
		FileType::Directory => {
			let mut header = tar::Header::new_gnu();
			header.set_entry_type(tar::EntryType::Directory);
			header.set_size(0);
			header.set_mode(0o755);
			header.set_cksum();
			builder.append_data(&mut header, hash_hex, std::io::empty()).map_err(Error::from)?;
		}
		FileType::Link => {
			let target = fs::read_link(abs_path.as_std_path()).map_err(|e| Error::io(abs_path.as_std_path(), e))?;
			let mut header = tar::Header::new_gnu();
			header.set_entry_type(tar::EntryType::Symlink);
			header.set_size(0);
			header.set_mode(0o777);
			builder.append_link(&mut header, hash_hex, &target).map_err(Error::from)?;
		}
		_ => return Err(Error::BadChroot(format!("cannot build fullfile for non-file type at {:?}", record.path))),
	}

	builder.into_inner().map_err(Error::from)
}

/// Generates (or skips, if already present) the fullfile for one hash.
fn generate_one(chroot_root: &Utf8Path, record: &FileRecord, hash_hex: &str, out_dir: &Utf8Path) -> Result<FullfilesStats> {
	let mut stats = FullfilesStats::default();
	let out_path = out_dir.join(format!("{hash_hex}.tar"));
	if out_path.exists() {
		stats.skipped += 1;
		return Ok(stats);
	}

	let uncompressed = build_uncompressed_tar(chroot_root, record, hash_hex)?;

	let best = if record.flags.file_type == FileType::Regular {
		// compressors operate on the raw tar bytes via a temp file, since
		// they're external processes reading from a path
		let tmp = out_dir.join(format!(".{hash_hex}.uncompressed"));
		fs::write(tmp.as_std_path(), &uncompressed).map_err(|e| Error::io(tmp.as_std_path(), e))?;
		let mut best: Option<(&'static str, Vec<u8>)> = None;
		for (name, args, canon) in COMPRESSORS {
			if let Some(bytes) = try_compress(name, args, tmp.as_std_path()) {
				if bytes.len() < uncompressed.len() && best.as_ref().map(|(_, b)| bytes.len() < b.len()).unwrap_or(true) {
					best = Some((canon, bytes));
				}
			}
		}
		let _ = fs::remove_file(tmp.as_std_path());
		best
	} else {
		None
	};

	match best {
		Some((canon, bytes)) => {
			fs::write(out_path.as_std_path(), &bytes).map_err(|e| Error::io(out_path.as_std_path(), e))?;
			*stats.per_compressor.entry(canon.to_string()).or_default() += 1;
			debug!(hash = hash_hex, compressor = canon, "fullfile compressed");
		}
		None => {
			fs::write(out_path.as_std_path(), &uncompressed).map_err(|e| Error::io(out_path.as_std_path(), e))?;
			stats.not_compressed += 1;
		}
	}

	Ok(stats)
}

/// Generates fullfiles for every distinct hash in `full` whose version
/// equals `version` and whose status is neither deleted nor ghosted (spec
/// §4.8).
///
/// Follows the coordinator + N-worker-task + bounded-error-channel
/// discipline spec §4.8/§5 prescribe: workers drain a bounded channel of
/// `FileRecord`s, the first worker error stops the coordinator from
/// feeding more work, and per-worker stats are merged once every worker
/// has drained or bailed. `chroot_root` is the `full` bundle's staged root
/// for `version`.
pub fn generate_fullfiles(full: &Manifest, version: u32, chroot_root: &Utf8Path, out_dir: &Utf8Path, workers: usize, registry: &crate::hash::HashRegistry) -> Result<FullfilesStats> {
	fs::create_dir_all(out_dir.as_std_path()).map_err(|e| Error::io(out_dir.as_std_path(), e))?;

	let candidates: Vec<FileRecord> = full.files.iter().filter(|f| f.version == version && !f.is_deleted()).cloned().collect();
	let total = candidates.len();
	let n_workers = workers.max(1);

	let (work_tx, work_rx) = bounded::<FileRecord>(n_workers * 2);
	let (err_tx, err_rx) = bounded::<Error>(n_workers);
	let (stats_tx, stats_rx) = bounded::<FullfilesStats>(n_workers);

	std::thread::scope(|scope| {
		for _ in 0..n_workers {
			let work_rx = work_rx.clone();
			let err_tx = err_tx.clone();
			let stats_tx = stats_tx.clone();
			scope.spawn(|| {
				let mut local = FullfilesStats::default();
				while let Ok(record) = work_rx.recv() {
					let hash_hex = registry.hex(record.hash);
					match generate_one(chroot_root, &record, &hash_hex, out_dir) {
						Ok(s) => local.merge(s),
						Err(e) => {
							let _ = err_tx.send(e);
							break;
						}
					}
				}
				let _ = stats_tx.send(local);
			});
		}
		drop(work_rx);
		drop(err_tx);
		drop(stats_tx);

		for record in candidates {
			if !err_rx.is_empty() {
				break;
			}
			if work_tx.send(record).is_err() {
				break;
			}
		}
		drop(work_tx);
	});

	if let Ok(e) = err_rx.try_recv() {
		return Err(e);
	}

	let mut stats = FullfilesStats::default();
	for s in stats_rx.try_iter() {
		stats.merge(s);
	}

	info!(count = total, skipped = stats.skipped, not_compressed = stats.not_compressed, "fullfiles generated");
	Ok(stats)
}
