//! Format-tiered manifest writer (spec §4.2) with atomic write-then-rename.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;

use camino::Utf8Path;

use super::Manifest;
use crate::error::{Error, Result};
use crate::hash::HashRegistry;

/// Historical client-side bug: `contentsize` in formats 1-25 is clamped to
/// this value when the real size would overflow it. Must be reproduced
/// exactly for clients that still read that format (spec §4.2, §9).
const FORMAT_25_CONTENTSIZE_CAP: u64 = (1u64 << 31) - 1;

fn render(m: &Manifest, registry: &HashRegistry) -> Result<String> {
	let h = &m.header;
	if h.timestamp == 0 {
		return Err(Error::InvalidManifest("cannot write manifest with zero timestamp".into()));
	}
	if h.version < h.previous {
		return Err(Error::InvalidManifest("cannot write manifest with version < previous".into()));
	}
	if h.minversion > h.version {
		return Err(Error::MinVersionViolation { minversion: h.minversion, version: h.version });
	}

	let contentsize = if h.format <= 25 && h.contentsize > FORMAT_25_CONTENTSIZE_CAP {
		FORMAT_25_CONTENTSIZE_CAP
	} else {
		h.contentsize
	};

	let mut out = String::new();
	writeln!(out, "MANIFEST\t{}", h.format).unwrap();
	writeln!(out, "version:\t{}", h.version).unwrap();
	writeln!(out, "previous:\t{}", h.previous).unwrap();
	if h.format >= 26 && h.minversion != 0 {
		writeln!(out, "minversion:\t{}", h.minversion).unwrap();
	}
	writeln!(out, "filecount:\t{}", m.files.len()).unwrap();
	writeln!(out, "timestamp:\t{}", h.timestamp).unwrap();
	writeln!(out, "contentsize:\t{contentsize}").unwrap();
	for inc in &h.includes {
		writeln!(out, "includes:\t{inc}").unwrap();
	}
	if h.format >= 29 {
		for opt in &h.also_add {
			writeln!(out, "also-add:\t{opt}").unwrap();
		}
	}
	out.push('\n');

	let mut sorted = m.clone();
	sorted.sort_for_write();
	for f in &sorted.files {
		writeln!(out, "{}\t{}\t{}\t{}", f.flags.to_string4(), registry.hex(f.hash), f.version, f.path).unwrap();
	}

	Ok(out)
}

/// Renders `m` and writes it to `path`, atomically: on any error after the
/// file is created, the partial file is removed rather than left behind.
pub fn write_atomic(m: &Manifest, path: &Utf8Path, registry: &HashRegistry) -> Result<()> {
	let text = render(m, registry)?;

	let tmp_path = path.with_extension("tmp");
	let write_result = (|| -> Result<()> {
		let mut f = fs::File::create(&tmp_path).map_err(|e| Error::io(tmp_path.as_std_path(), e))?;
		f.write_all(text.as_bytes()).map_err(|e| Error::io(tmp_path.as_std_path(), e))?;
		f.sync_all().map_err(|e| Error::io(tmp_path.as_std_path(), e))?;
		Ok(())
	})();

	if let Err(e) = write_result {
		let _ = fs::remove_file(&tmp_path);
		return Err(e);
	}

	fs::rename(&tmp_path, path).map_err(|e| {
		let _ = fs::remove_file(&tmp_path);
		Error::io(path.as_std_path(), e)
	})?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use camino::Utf8PathBuf;

	use super::*;
	use crate::flags::Flags;
	use crate::hash::Hashval;
	use crate::manifest::{parse, FileRecord, Header};

	fn sample(format: u32) -> Manifest {
		let header = Header {
			format,
			version: 10,
			previous: 0,
			minversion: 0,
			filecount: 1,
			timestamp: 123,
			contentsize: 4,
			includes: vec!["os-core".to_string()],
			also_add: vec![],
		};
		Manifest::new(header, vec![FileRecord::new(Utf8PathBuf::from("/foo"), Hashval::ZERO, 10, Flags::unset())])
	}

	#[test]
	fn round_trips_through_parse() {
		let registry = crate::hash::HashRegistry::new();
		let m = sample(27);
		let text = render(&m, &registry).unwrap();
		let parsed = parse::parse(&text, &registry).unwrap();
		assert_eq!(parsed.header.version, m.header.version);
		assert_eq!(parsed.files.len(), m.files.len());
		assert_eq!(parsed.files[0].path, m.files[0].path);
	}

	#[test]
	fn is_deterministic_across_runs() {
		let registry = crate::hash::HashRegistry::new();
		let m = sample(29);
		assert_eq!(render(&m, &registry).unwrap(), render(&m, &registry).unwrap());
	}

	#[test]
	fn clamps_contentsize_for_format_25_and_below() {
		let registry = crate::hash::HashRegistry::new();
		let mut m = sample(25);
		m.header.contentsize = u64::MAX;
		let text = render(&m, &registry).unwrap();
		assert!(text.contains(&format!("contentsize:\t{FORMAT_25_CONTENTSIZE_CAP}")));
	}

	#[test]
	fn does_not_clamp_contentsize_for_format_26_and_above() {
		let registry = crate::hash::HashRegistry::new();
		let mut m = sample(26);
		m.header.contentsize = FORMAT_25_CONTENTSIZE_CAP + 1000;
		let text = render(&m, &registry).unwrap();
		assert!(text.contains(&format!("contentsize:\t{}", FORMAT_25_CONTENTSIZE_CAP + 1000)));
	}

	#[test]
	fn omits_minversion_when_zero_and_emits_when_set() {
		let registry = crate::hash::HashRegistry::new();
		let m = sample(27);
		assert!(!render(&m, &registry).unwrap().contains("minversion:"));

		let mut m2 = sample(27);
		m2.header.minversion = 5;
		assert!(render(&m2, &registry).unwrap().contains("minversion:\t5"));
	}
}
