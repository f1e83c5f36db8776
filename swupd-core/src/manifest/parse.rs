//! Strict grammar parser for the manifest wire format (spec §4.2).

use camino::Utf8PathBuf;

use super::{FileRecord, Header, Manifest};
use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::hash::HashRegistry;

const REQUIRED_FIELDS: &[&str] = &["MANIFEST", "version:", "previous:", "filecount:", "timestamp:", "contentsize:"];

fn bad(msg: impl Into<String>) -> Error {
	Error::InvalidManifest(msg.into())
}

/// Parses a full manifest from its on-disk text form.
///
/// `registry` is used to intern the 64-hex-digit hash of every entry into a
/// [`crate::hash::Hashval`] handle.
pub fn parse(text: &str, registry: &HashRegistry) -> Result<Manifest> {
	let mut lines = text.split('\n');

	let mut header = Header::default();
	let mut seen_format = false;
	let mut seen_version = false;
	let mut seen_previous = false;
	let mut seen_filecount = false;
	let mut seen_timestamp = false;
	let mut seen_contentsize = false;
	let mut seen_minversion = false;

	loop {
		let line = lines.next().ok_or_else(|| bad("manifest ended before header terminator"))?;
		if line.is_empty() {
			break;
		}
		let (field, value) = line.split_once('\t').ok_or_else(|| bad(format!("malformed header line {line:?}")))?;

		match field {
			"MANIFEST" => {
				if seen_format {
					return Err(bad("duplicate MANIFEST field"));
				}
				seen_format = true;
				header.format = value.parse().map_err(|_| bad(format!("bad format number {value:?}")))?;
			}
			"version:" => {
				if seen_version {
					return Err(bad("duplicate version: field"));
				}
				seen_version = true;
				header.version = value.parse().map_err(|_| bad(format!("bad version {value:?}")))?;
			}
			"previous:" => {
				if seen_previous {
					return Err(bad("duplicate previous: field"));
				}
				seen_previous = true;
				header.previous = value.parse().map_err(|_| bad(format!("bad previous {value:?}")))?;
			}
			"minversion:" => {
				if seen_minversion {
					return Err(bad("duplicate minversion: field"));
				}
				seen_minversion = true;
				header.minversion = value.parse().map_err(|_| bad(format!("bad minversion {value:?}")))?;
			}
			"filecount:" => {
				if seen_filecount {
					return Err(bad("duplicate filecount: field"));
				}
				seen_filecount = true;
				header.filecount = value.parse().map_err(|_| bad(format!("bad filecount {value:?}")))?;
			}
			"timestamp:" => {
				if seen_timestamp {
					return Err(bad("duplicate timestamp: field"));
				}
				seen_timestamp = true;
				header.timestamp = value.parse().map_err(|_| bad(format!("bad timestamp {value:?}")))?;
			}
			"contentsize:" => {
				if seen_contentsize {
					return Err(bad("duplicate contentsize: field"));
				}
				seen_contentsize = true;
				header.contentsize = value.parse().map_err(|_| bad(format!("bad contentsize {value:?}")))?;
			}
			"includes:" => header.includes.push(value.to_string()),
			"also-add:" => header.also_add.push(value.to_string()),
			other => return Err(bad(format!("unknown header field {other:?}"))),
		}
	}

	for required in REQUIRED_FIELDS {
		let present = match *required {
			"MANIFEST" => seen_format,
			"version:" => seen_version,
			"previous:" => seen_previous,
			"filecount:" => seen_filecount,
			"timestamp:" => seen_timestamp,
			"contentsize:" => seen_contentsize,
			_ => unreachable!(),
		};
		if !present {
			return Err(bad(format!("missing required header field {required:?}")));
		}
	}
	if header.timestamp == 0 {
		return Err(bad("timestamp must be non-zero"));
	}
	if header.version < header.previous {
		return Err(bad("version must be >= previous"));
	}
	if header.minversion > header.version {
		return Err(Error::MinVersionViolation { minversion: header.minversion, version: header.version });
	}

	let mut files = Vec::new();
	let mut trailing_blank_seen = false;
	for line in lines {
		if line.is_empty() {
			if trailing_blank_seen {
				return Err(bad("extra blank line in manifest body"));
			}
			// split('\n') on a trailing-newline-terminated file yields one
			// empty trailing element; tolerate exactly that one.
			trailing_blank_seen = true;
			continue;
		}
		files.push(parse_entry(line, registry)?);
	}

	if files.is_empty() {
		return Err(bad("manifest body has zero entries"));
	}
	if header.filecount != 0 && header.filecount as usize != files.len() {
		return Err(bad(format!("filecount {} does not match {} entries", header.filecount, files.len())));
	}
	header.filecount = files.len() as u32;

	Ok(Manifest::new(header, files))
}

fn parse_entry(line: &str, registry: &HashRegistry) -> Result<FileRecord> {
	let mut parts = line.splitn(4, '\t');
	let flags_s = parts.next().ok_or_else(|| bad(format!("empty entry line {line:?}")))?;
	let hash_s = parts.next().ok_or_else(|| bad(format!("entry missing hash: {line:?}")))?;
	let version_s = parts.next().ok_or_else(|| bad(format!("entry missing version: {line:?}")))?;
	let path_s = parts.next().ok_or_else(|| bad(format!("entry missing path: {line:?}")))?;

	let flags = Flags::parse(flags_s)?;
	if hash_s.len() != 64 {
		return Err(bad(format!("hash must be 64 hex chars, got {hash_s:?}")));
	}
	let hash = registry.intern(hash_s)?;
	let version: u32 = version_s.parse().map_err(|_| bad(format!("bad entry version {version_s:?}")))?;
	let path = Utf8PathBuf::from(path_s);

	Ok(FileRecord::new(path, hash, version, flags))
}
