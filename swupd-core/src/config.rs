//! Hand-rolled parser for `groups.ini` and `server.ini` (spec §6). Neither
//! file is a general-purpose ini dialect - both are small, fixed-schema
//! `[section]` / `key=value` files - so this follows the manifest parser's
//! own approach of a bespoke line-oriented reader rather than pulling in a
//! format crate for a shape this narrow.

use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BundleStatus {
	Active,
	Experimental,
}

#[derive(Clone, Debug)]
pub struct BundleGroup {
	pub group: String,
	pub status: BundleStatus,
}

/// Parsed `groups.ini`: ordered bundle names (order matters, `os-core` must
/// be present) mapped to their group metadata.
#[derive(Clone, Debug, Default)]
pub struct Groups {
	pub order: Vec<String>,
	pub by_name: BTreeMap<String, BundleGroup>,
}

impl Groups {
	pub fn bundle_names(&self) -> &[String] {
		&self.order
	}
}

#[derive(Clone, Debug, Default)]
pub struct DebuginfoConfig {
	pub banned: bool,
	pub lib: String,
	pub src: String,
}

#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
	pub emptydir: String,
	pub imagebase: String,
	pub outputdir: String,
	pub debuginfo: DebuginfoConfig,
}

/// Minimal `[section]` / `key=value` ini reader shared by both config
/// files. Blank lines and `#`/`;`-prefixed comment lines are ignored.
fn parse_sections(text: &str) -> Vec<(String, Vec<(String, String)>)> {
	let mut sections = Vec::new();
	let mut current: Option<(String, Vec<(String, String)>)> = None;

	for raw_line in text.lines() {
		let line = raw_line.trim();
		if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
			continue;
		}
		if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
			if let Some(done) = current.take() {
				sections.push(done);
			}
			current = Some((name.to_string(), Vec::new()));
			continue;
		}
		if let Some((key, value)) = line.split_once('=') {
			if let Some((_, kvs)) = current.as_mut() {
				kvs.push((key.trim().to_string(), value.trim().to_string()));
			}
		}
	}
	if let Some(done) = current.take() {
		sections.push(done);
	}
	sections
}

/// Parses `groups.ini`. Every section is a bundle name; required keys are
/// `group` and `status`.
pub fn parse_groups(text: &str) -> Result<Groups> {
	let mut groups = Groups::default();
	for (name, kvs) in parse_sections(text) {
		let mut group = None;
		let mut status = BundleStatus::Active;
		for (k, v) in kvs {
			match k.as_str() {
				"group" => group = Some(v),
				"status" => {
					status = match v.as_str() {
						"ACTIVE" => BundleStatus::Active,
						"Experimental" => BundleStatus::Experimental,
						other => return Err(Error::ConfigInvalid(format!("unknown bundle status {other:?} for {name}"))),
					}
				}
				other => return Err(Error::ConfigInvalid(format!("unknown groups.ini key {other:?} in [{name}]"))),
			}
		}
		let group = group.unwrap_or_else(|| name.clone());
		groups.order.push(name.clone());
		groups.by_name.insert(name, BundleGroup { group, status });
	}

	if !groups.by_name.contains_key("os-core") {
		return Err(Error::ConfigInvalid("groups.ini must contain an os-core bundle".into()));
	}

	Ok(groups)
}

/// Parses `server.ini`.
pub fn parse_server_config(text: &str) -> Result<ServerConfig> {
	let mut cfg = ServerConfig::default();
	for (section, kvs) in parse_sections(text) {
		match section.as_str() {
			"Server" => {
				for (k, v) in kvs {
					match k.as_str() {
						"emptydir" => cfg.emptydir = v,
						"imagebase" => cfg.imagebase = v,
						"outputdir" => cfg.outputdir = v,
						other => return Err(Error::ConfigInvalid(format!("unknown server.ini [Server] key {other:?}"))),
					}
				}
			}
			"Debuginfo" => {
				for (k, v) in kvs {
					match k.as_str() {
						"banned" => cfg.debuginfo.banned = v == "true",
						"lib" => cfg.debuginfo.lib = v,
						"src" => cfg.debuginfo.src = v,
						other => return Err(Error::ConfigInvalid(format!("unknown server.ini [Debuginfo] key {other:?}"))),
					}
				}
			}
			other => return Err(Error::ConfigInvalid(format!("unknown server.ini section [{other}]"))),
		}
	}
	Ok(cfg)
}

pub fn read_groups(path: &Utf8Path) -> Result<Groups> {
	let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.as_std_path(), e))?;
	parse_groups(&text)
}

pub fn read_server_config(path: &Utf8Path) -> Result<ServerConfig> {
	let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.as_std_path(), e))?;
	parse_server_config(&text)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_groups_with_os_core() {
		let text = "[os-core]\ngroup=os-core\nstatus=ACTIVE\n\n[editors]\ngroup=editors\nstatus=Experimental\n";
		let g = parse_groups(text).unwrap();
		assert_eq!(g.order, vec!["os-core", "editors"]);
		assert_eq!(g.by_name["editors"].status, BundleStatus::Experimental);
	}

	#[test]
	fn rejects_groups_missing_os_core() {
		let text = "[editors]\ngroup=editors\nstatus=ACTIVE\n";
		assert!(parse_groups(text).is_err());
	}

	#[test]
	fn parses_server_ini() {
		let text = "[Server]\nemptydir=/var/empty\nimagebase=/var/image\noutputdir=/var/www\n\n[Debuginfo]\nbanned=true\nlib=/usr/lib/debug\nsrc=/usr/src/debug\n";
		let cfg = parse_server_config(text).unwrap();
		assert_eq!(cfg.imagebase, "/var/image");
		assert!(cfg.debuginfo.banned);
	}
}
