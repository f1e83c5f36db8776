//! Content hashing (spec §4.1): a two-stage HMAC-SHA256 construction over a
//! packed stat record plus file content, and the process-wide(ish) interning
//! registry that turns 64-hex-digit hash strings into small `Hashval` handles.

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;

use camino::Utf8Path;
use dashmap::DashMap;
use hex::ToHex;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the packed stat record hashed ahead of file content.
const STAT_BYTES_LEN: usize = 40;

/// The literal bytes hashed in place of directory contents.
const DIRECTORY_MARKER: &[u8] = b"DIRECTORY";

/// Kind of on-disk object being hashed, determining how `data` is derived
/// from the file and how the stat record is adjusted before hashing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectKind {
	Regular,
	Directory,
	Symlink,
}

/// A 40-byte little-endian packed stat record: mode, uid, gid, rdev (always
/// zero), size - matching the C layout in spec §4.1 exactly.
fn pack_stat_bytes(mode: u64, uid: u64, gid: u64, size: u64) -> [u8; STAT_BYTES_LEN] {
	let mut buf = [0u8; STAT_BYTES_LEN];
	buf[0..8].copy_from_slice(&mode.to_le_bytes());
	buf[8..16].copy_from_slice(&uid.to_le_bytes());
	buf[16..24].copy_from_slice(&gid.to_le_bytes());
	buf[24..32].copy_from_slice(&0u64.to_le_bytes()); // st_rdev always zero
	buf[32..40].copy_from_slice(&size.to_le_bytes());
	buf
}

/// Derives the HMAC key from the (possibly type-adjusted) stat bytes.
fn derive_key(stat_bytes: &[u8; STAT_BYTES_LEN]) -> Vec<u8> {
	let mut inner = HmacSha256::new_from_slice(stat_bytes).expect("HMAC accepts any key length");
	inner.update(b"");
	inner.finalize().into_bytes().to_vec()
}

/// A streaming HMAC-SHA256 hasher already keyed; used for incremental
/// content hashing so callers don't need to buffer whole files in memory.
pub struct StreamHasher {
	mac: HmacSha256,
}

impl StreamHasher {
	fn with_key(key: &[u8]) -> Self {
		Self { mac: HmacSha256::new_from_slice(key).expect("HMAC accepts any key length") }
	}

	pub fn write(&mut self, bytes: &[u8]) {
		self.mac.update(bytes);
	}

	pub fn sum(self) -> String {
		self.mac.finalize().into_bytes().encode_hex::<String>()
	}
}

impl std::io::Write for StreamHasher {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.mac.update(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

/// Hashes a regular file's contents by streaming it through a keyed
/// [`StreamHasher`] - used directly by callers that already hold an open
/// reader (pack validation, applying a delta before re-hashing the result).
pub fn hash_reader_as_regular(reader: &mut impl Read, mode: u64, uid: u64, gid: u64, size: u64) -> Result<String> {
	let stat_bytes = pack_stat_bytes(mode, uid, gid, size);
	let key = derive_key(&stat_bytes);
	let mut hasher = StreamHasher::with_key(&key);
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = reader.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.write(&buf[..n]);
	}
	Ok(hasher.sum())
}

/// Computes the content hash of a path on disk, following spec §4.1's rules
/// for what counts as `data` and how the stat record is adjusted per type.
/// Does not follow symlinks - the metadata and the hashed bytes are always
/// those of the path itself.
pub fn hash_path(p: &Path) -> Result<String> {
	let meta = fs::symlink_metadata(p).map_err(|e| Error::io(p, e))?;
	let ft = meta.file_type();

	if ft.is_symlink() {
		let target = fs::read_link(p).map_err(|e| Error::io(p, e))?;
		let target_bytes = target.as_os_str().as_encoded_bytes();
		// st_mode set to 0 before hashing; size = target length
		let stat_bytes = pack_stat_bytes(0, meta.uid() as u64, meta.gid() as u64, target_bytes.len() as u64);
		let key = derive_key(&stat_bytes);
		let mut hasher = StreamHasher::with_key(&key);
		hasher.write(target_bytes);
		Ok(hasher.sum())
	} else if ft.is_dir() {
		// st_size set to 0 before hashing
		let stat_bytes = pack_stat_bytes(meta.mode() as u64, meta.uid() as u64, meta.gid() as u64, 0);
		let key = derive_key(&stat_bytes);
		let mut hasher = StreamHasher::with_key(&key);
		hasher.write(DIRECTORY_MARKER);
		Ok(hasher.sum())
	} else if ft.is_file() {
		let stat_bytes = pack_stat_bytes(meta.mode() as u64, meta.uid() as u64, meta.gid() as u64, meta.size() as u64);
		let key = derive_key(&stat_bytes);
		let mut hasher = StreamHasher::with_key(&key);
		let mut f = File::open(p).map_err(|e| Error::io(p, e))?;
		let mut buf = [0u8; 256 * 1024];
		loop {
			let n = f.read(&mut buf).map_err(|e| Error::io(p, e))?;
			if n == 0 {
				break;
			}
			hasher.write(&buf[..n]);
		}
		Ok(hasher.sum())
	} else if ft.is_block_device() || ft.is_char_device() || ft.is_fifo() || ft.is_socket() {
		Err(Error::BadChroot(format!("unsupported file type at {p:?}")))
	} else {
		Err(Error::BadChroot(format!("unsupported file type at {p:?}")))
	}
}

/// `Utf8Path` convenience wrapper, matching the path type the rest of the
/// crate (and the teacher's own `hash::hash_file`) uses for chroot-relative work.
pub fn hash_utf8(p: &Utf8Path) -> Result<String> {
	hash_path(p.as_std_path())
}

/// A small interned handle standing in for a 64-hex-digit hash string.
/// Equality/ordering is only meaningful between handles drawn from the same
/// [`HashRegistry`] - see that type's docs for why a per-build registry is
/// used instead of one global process-wide singleton.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Hashval(u32);

impl Hashval {
	/// Handle 0, always mapping to the all-zeros hash (spec §4.1).
	pub const ZERO: Hashval = Hashval(0);

	pub fn is_zero(self) -> bool {
		self.0 == 0
	}
}

struct Inner {
	by_str: std::collections::HashMap<Box<str>, Hashval>,
	by_handle: Vec<Box<str>>,
}

/// Append-only interning registry for content hashes.
///
/// The spec describes this as "process-wide ... protected by a
/// reader-preferring lock". We instead scope one registry per build (an
/// explicit context passed around, cheaply `Clone`-able via `Arc`) rather
/// than a single process-global singleton: this removes cross-test
/// interference (the design notes call this out as the main argument for
/// the per-context approach) at no cost to a real build, which only ever
/// runs one registry's worth of work anyway.
#[derive(Clone)]
pub struct HashRegistry(Arc<RwLock<Inner>>);

impl Default for HashRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl HashRegistry {
	pub fn new() -> Self {
		let zero: Box<str> = Box::from("0".repeat(64));
		Self(Arc::new(RwLock::new(Inner {
			by_str: std::collections::HashMap::from([(zero.clone(), Hashval::ZERO)]),
			by_handle: vec![zero],
		})))
	}

	/// Interns a lowercase 64-hex-digit hash string, returning its handle.
	/// Concurrent lookups proceed without blocking each other; only the
	/// first sighting of a new string takes the write lock.
	pub fn intern(&self, hex: &str) -> Result<Hashval> {
		if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
			return Err(Error::InvalidManifest(format!("not a 64-char lowercase hex hash: {hex:?}")));
		}

		{
			let guard = self.0.read();
			if let Some(h) = guard.by_str.get(hex) {
				return Ok(*h);
			}
		}

		let mut guard = self.0.write();
		// re-check: another writer may have inserted it while we waited
		if let Some(h) = guard.by_str.get(hex) {
			return Ok(*h);
		}
		let handle = Hashval(guard.by_handle.len() as u32);
		let boxed: Box<str> = Box::from(hex);
		guard.by_handle.push(boxed.clone());
		guard.by_str.insert(boxed, handle);
		Ok(handle)
	}

	/// Resolves a handle back to its hex string.
	pub fn hex(&self, h: Hashval) -> String {
		self.0.read().by_handle[h.0 as usize].to_string()
	}

	/// Hashes a path and interns the result in one step.
	pub fn hash_and_intern(&self, p: &Path) -> Result<Hashval> {
		let hex = hash_path(p)?;
		self.intern(&hex)
	}
}

/// Cached `stat`-derived metadata for a single chroot walk, avoiding
/// repeated `lstat` calls for paths visited more than once (e.g. once while
/// walking a bundle and again while resolving includes). Lock-free,
/// insert-once: a `DashMap` entry is only ever written the first time a
/// path is looked up.
#[derive(Default, Clone)]
pub struct FileInfoCache(Arc<DashMap<std::path::PathBuf, FileInfo>>);

#[derive(Copy, Clone, Debug)]
pub struct FileInfo {
	pub size: u64,
	pub kind: ObjectKind,
}

impl FileInfoCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get_or_stat(&self, p: &Path) -> Result<FileInfo> {
		if let Some(v) = self.0.get(p) {
			return Ok(*v);
		}
		let meta = fs::symlink_metadata(p).map_err(|e| Error::io(p, e))?;
		let ft = meta.file_type();
		let kind = if ft.is_symlink() {
			ObjectKind::Symlink
		} else if ft.is_dir() {
			ObjectKind::Directory
		} else if ft.is_file() {
			ObjectKind::Regular
		} else {
			return Err(Error::BadChroot(format!("unsupported file type at {p:?}")));
		};
		let size = match kind {
			ObjectKind::Symlink => fs::read_link(p).map_err(|e| Error::io(p, e))?.as_os_str().len() as u64,
			ObjectKind::Directory => 0,
			ObjectKind::Regular => meta.size(),
		};
		let info = FileInfo { size, kind };
		// insert-once: if another thread raced us, keep whichever landed first
		self.0.entry(p.to_path_buf()).or_insert(info);
		Ok(info)
	}
}
