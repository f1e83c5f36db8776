//! The top-level driver, `create_manifests` (spec §4.3): wires chroot
//! walking, include resolution, peer-linking, rename detection, heuristics
//! and MoM assembly into one batch transformation.

use std::collections::{BTreeMap, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::info;

use crate::chroot::walk_chroot;
use crate::config::read_groups;
use crate::diff::{apply_heuristics, detect_renames, link_peers};
use crate::error::{Error, Result};
use crate::flags::{FileType, Flags, Status};
use crate::hash::HashRegistry;
use crate::index_bundle::{build_index_text, INDEX_BUNDLE_NAME, INDEX_FILE_PATH};
use crate::manifest::{self, FileRecord, Header, Manifest};

pub const FULL_BUNDLE_NAME: &str = "full";

#[derive(Clone, Debug)]
pub struct BuildConfig {
	pub version: u32,
	pub previous: u32,
	pub minversion: u32,
	pub format: u32,
	pub state_dir: Utf8PathBuf,
	pub workers: usize,
	/// Unix seconds stamped into every manifest header this build writes
	/// (spec §3). The caller supplies this rather than the driver reading
	/// the system clock, so a build is reproducible given the same inputs.
	pub timestamp: i64,
}

impl BuildConfig {
	/// Turns the `-T 0` ⇒ "use every logical processor" convention into a
	/// concrete thread count. There is no CLI layer to do this translation
	/// upstream of us (spec §1 excludes argument parsing), so callers that
	/// accept a user-facing thread count should route it through here.
	pub fn resolve_threads(requested: usize) -> usize {
		if requested == 0 {
			num_cpus::get()
		} else {
			requested
		}
	}
}

/// Optional per-bundle metadata (spec §6's `<bundle>-info`).
#[derive(Clone, Debug, Default, Deserialize)]
struct BundleInfoFile {
	#[serde(default)]
	includes: Vec<String>,
	#[serde(default)]
	optional: Vec<String>,
}

fn read_bundle_info(state_dir: &Utf8Path, version: u32, bundle: &str) -> Result<BundleInfoFile> {
	let path = state_dir.join("image").join(version.to_string()).join(format!("{bundle}-info"));
	if !path.exists() {
		return Ok(BundleInfoFile::default());
	}
	let text = fs::read_to_string(path.as_std_path()).map_err(|e| Error::io(path.as_std_path(), e))?;
	serde_json::from_str(&text).map_err(|e| Error::InvalidManifest(format!("bad bundle-info for {bundle}: {e}")))
}

fn manifest_path(state_dir: &Utf8Path, version: u32, bundle: &str) -> Utf8PathBuf {
	state_dir.join("www").join(version.to_string()).join(format!("Manifest.{bundle}"))
}

fn load_prior_manifest(state_dir: &Utf8Path, version: u32, bundle: &str, registry: &HashRegistry) -> Result<Option<Manifest>> {
	let path = manifest_path(state_dir, version, bundle);
	if !path.exists() {
		return Ok(None);
	}
	let text = fs::read_to_string(path.as_std_path()).map_err(|e| Error::io(path.as_std_path(), e))?;
	Ok(Some(manifest::parse(&text, registry)?))
}

/// One bundle's working state across the build's stages.
struct BundleBuild {
	name: String,
	includes: Vec<String>,
	optional: Vec<String>,
	initial: Vec<FileRecord>,
}

/// Every bundle ships a tracking file at this path marking itself as
/// installed, independent of the manifest-pointer records step 5 adds for
/// bundles it includes (spec §8 scenario 1: a fresh `test-bundle` manifest
/// contains both `/foo` and `/usr/share/clear/bundles/test-bundle`).
fn own_bundle_marker_path(bundle: &str) -> Utf8PathBuf {
	Utf8PathBuf::from(format!("/usr/share/clear/bundles/{bundle}"))
}

/// Result of a single build run.
pub struct BuildOutput {
	pub mom: Manifest,
	pub full: Manifest,
	pub written_bundles: Vec<String>,
}

/// The driver. See spec §4.3 for the numbered steps this follows.
pub fn create_manifests(cfg: &BuildConfig, registry: &HashRegistry) -> Result<BuildOutput> {
	let groups = read_groups(&cfg.state_dir.join("groups.ini"))?;

	if cfg.minversion > cfg.version {
		return Err(Error::MinVersionViolation { minversion: cfg.minversion, version: cfg.version });
	}

	let prev_mom = {
		let path = manifest_path(&cfg.state_dir, cfg.previous, "MoM");
		if cfg.previous != 0 && path.exists() {
			let text = fs::read_to_string(path.as_std_path()).map_err(|e| Error::io(path.as_std_path(), e))?;
			Some(manifest::parse(&text, registry)?)
		} else {
			None
		}
	};
	let prev_versions: BTreeMap<String, u32> = prev_mom.as_ref().map(|m| m.files.iter().map(|f| (f.path.as_str().to_string(), f.version)).collect()).unwrap_or_default();

	// step 3: walk every non-full bundle's chroot in parallel
	let pool = rayon::ThreadPoolBuilder::new().num_threads(cfg.workers.max(1)).build().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
	let walked: Vec<Result<BundleBuild>> = pool.install(|| {
		groups
			.bundle_names()
			.par_iter()
			.map(|name| {
				let info = read_bundle_info(&cfg.state_dir, cfg.version, name)?;
				let chroot = cfg.state_dir.join("image").join(cfg.version.to_string()).join(name);
				let initial = walk_chroot(&chroot, cfg.version, registry)?;
				Ok(BundleBuild { name: name.clone(), includes: info.includes, optional: info.optional, initial })
			})
			.collect()
	});

	let mut bundles: Vec<BundleBuild> = Vec::with_capacity(walked.len());
	for w in walked {
		bundles.push(w?);
	}

	// step 4: resolve includes - os-core is implicit for every non-core, non-full bundle
	for b in bundles.iter_mut() {
		if b.name != "os-core" && !b.includes.iter().any(|i| i == "os-core") {
			b.includes.push("os-core".to_string());
		}
	}

	// preloaded once so both the index-bundle implicit-include check below
	// and per-bundle peer-linking later don't parse the same file twice
	let mut old_manifests: BTreeMap<String, Option<Manifest>> = BTreeMap::new();
	for b in &bundles {
		let prior_version = prev_versions.get(&b.name).copied().unwrap_or(if cfg.previous != 0 { cfg.previous } else { 0 });
		old_manifests.insert(b.name.clone(), load_prior_manifest(&cfg.state_dir, prior_version, &b.name, registry)?);
	}

	// the update index is implicitly included whenever *this bundle's own*
	// prior manifest already named it in `includes` (spec §4.7)
	for b in bundles.iter_mut() {
		let was_included_before = old_manifests.get(&b.name).and_then(|m| m.as_ref()).map(|m| m.header.includes.iter().any(|i| i == INDEX_BUNDLE_NAME)).unwrap_or(false);
		if was_included_before && !b.includes.iter().any(|i| i == INDEX_BUNDLE_NAME) {
			b.includes.push(INDEX_BUNDLE_NAME.to_string());
		}
	}

	// bundle cycle handling (spec §8 scenario 5): any path present under two
	// mutually-including bundles is subtracted from both and attributed to
	// os-core instead, by name lookup into the include graph.
	deduplicate_cyclic_includes(&mut bundles);

	// step 5: inject sub-manifest (type M) records for every bundle this one includes
	inject_submanifest_records(&mut bundles, cfg.version);

	// step 6/7: peer-link each bundle, emit only if changed
	let mut written_bundles = Vec::new();
	let mut new_mom_entries: Vec<FileRecord> = Vec::new();
	let mut full_files: Vec<FileRecord> = Vec::new();

	for b in &mut bundles {
		let prior_version = prev_versions.get(&b.name).copied().unwrap_or(if cfg.previous != 0 { cfg.previous } else { 0 });
		let old_manifest = old_manifests.remove(&b.name).flatten();
		let old_files = old_manifest.as_ref().map(|m| m.files.clone()).unwrap_or_default();

		let (mut linked, stats) = link_peers(std::mem::take(&mut b.initial), &old_files, cfg.version, cfg.minversion);

		let added: Vec<usize> = linked.iter().enumerate().filter(|(_, f)| f.flags.status == Status::Present && f.version == cfg.version && f.old_peer_index.is_none()).map(|(i, _)| i).collect();
		let removed: Vec<usize> = linked.iter().enumerate().filter(|(_, f)| f.is_deleted() && f.version == cfg.version).map(|(i, _)| i).collect();
		detect_renames(&mut linked, &added, &removed);
		apply_heuristics(&mut linked);

		let changed_includes = {
			let old_includes: HashSet<&str> = old_manifest.as_ref().map(|m| m.header.includes.iter().map(|s| s.as_str()).collect()).unwrap_or_default();
			let new_includes: HashSet<&str> = b.includes.iter().map(|s| s.as_str()).collect();
			old_includes != new_includes
		};

		let should_emit = stats.any_change() || changed_includes;

		for f in &linked {
			if f.flags.status == Status::Present {
				let existing = full_files.iter_mut().find(|ff| ff.path == f.path);
				match existing {
					Some(existing) if existing.version < f.version => existing.version = f.version,
					Some(_) => {}
					None => full_files.push(f.clone()),
				}
			}
		}

		if !should_emit {
			if let Some(old) = old_manifest {
				new_mom_entries.push(FileRecord::new(Utf8PathBuf::from(b.name.clone()), crate::hash::Hashval::ZERO, old.header.version, Flags { file_type: FileType::Manifest, ..Flags::unset() }));
			}
			continue;
		}

		let filecount = linked.len() as u32;
		let header = Header {
			format: cfg.format,
			version: cfg.version,
			previous: prior_version,
			minversion: cfg.minversion,
			filecount,
			timestamp: current_build_timestamp(cfg),
			contentsize: linked.iter().map(|f| f.size.unwrap_or(0)).sum(),
			includes: b.includes.clone(),
			also_add: b.optional.clone(),
		};
		let out_manifest = Manifest::new(header, linked);
		let out_path = manifest_path(&cfg.state_dir, cfg.version, &b.name);
		manifest::write_atomic(&out_manifest, &out_path, registry)?;
		written_bundles.push(b.name.clone());

		let experimental = groups.by_name.get(&b.name).map(|g| g.status == crate::config::BundleStatus::Experimental).unwrap_or(false);
		let mut mom_flags = Flags { file_type: FileType::Manifest, ..Flags::unset() };
		if experimental && cfg.format >= 27 {
			mom_flags.status = Status::Experimental;
		}
		new_mom_entries.push(FileRecord::new(Utf8PathBuf::from(b.name.clone()), crate::hash::Hashval::ZERO, cfg.version, mom_flags));

		info!(bundle = b.name, version = cfg.version, changed = stats.changed, added = stats.added, removed = stats.removed, "bundle manifest written");
	}

	// step 8: carry forward unchanged MoM entries not already replaced
	if let Some(prev) = &prev_mom {
		let seen: HashSet<&str> = new_mom_entries.iter().map(|f| f.path.as_str()).collect();
		for f in &prev.files {
			if f.path.as_str() == INDEX_BUNDLE_NAME {
				continue;
			}
			if !seen.contains(f.path.as_str()) {
				new_mom_entries.push(f.clone());
			}
		}
	}
	new_mom_entries.sort_by(|a, b| a.path.cmp(&b.path));

	// index bundle (spec §4.7, §4.3 step 8): regenerated from the bundle
	// manifests the MoM just settled on, peer-linked and written/carried
	// forward exactly like any other bundle.
	let index_prior_version = prev_versions.get(INDEX_BUNDLE_NAME).copied().unwrap_or(if cfg.previous != 0 { cfg.previous } else { 0 });
	let index_old_manifest = load_prior_manifest(&cfg.state_dir, index_prior_version, INDEX_BUNDLE_NAME, registry)?;
	let index_old_files = index_old_manifest.as_ref().map(|m| m.files.clone()).unwrap_or_default();

	let mom_so_far = Manifest::new(Header::default(), new_mom_entries.clone());
	let index_text = generate_index_bundle(&cfg.state_dir, &mom_so_far, registry)?;
	let index_bytes = index_text.into_bytes();
	let index_hex = crate::hash::hash_reader_as_regular(&mut std::io::Cursor::new(&index_bytes), 0o100644, 0, 0, index_bytes.len() as u64)?;
	let index_hash = registry.intern(&index_hex)?;
	let mut index_initial = FileRecord::new(Utf8PathBuf::from(INDEX_FILE_PATH), index_hash, cfg.version, Flags { file_type: FileType::Regular, ..Flags::unset() });
	index_initial.size = Some(index_bytes.len() as u64);

	let (mut index_linked, index_stats) = link_peers(vec![index_initial], &index_old_files, cfg.version, cfg.minversion);
	let index_added: Vec<usize> = index_linked.iter().enumerate().filter(|(_, f)| f.flags.status == Status::Present && f.version == cfg.version && f.old_peer_index.is_none()).map(|(i, _)| i).collect();
	let index_removed: Vec<usize> = index_linked.iter().enumerate().filter(|(_, f)| f.is_deleted() && f.version == cfg.version).map(|(i, _)| i).collect();
	detect_renames(&mut index_linked, &index_added, &index_removed);
	apply_heuristics(&mut index_linked);

	if index_stats.any_change() {
		let index_header = Header {
			format: cfg.format,
			version: cfg.version,
			previous: index_prior_version,
			minversion: cfg.minversion,
			filecount: index_linked.len() as u32,
			timestamp: current_build_timestamp(cfg),
			contentsize: index_linked.iter().map(|f| f.size.unwrap_or(0)).sum(),
			includes: vec![],
			also_add: vec![],
		};
		let index_manifest = Manifest::new(index_header, index_linked.clone());
		manifest::write_atomic(&index_manifest, &manifest_path(&cfg.state_dir, cfg.version, INDEX_BUNDLE_NAME), registry)?;
		written_bundles.push(INDEX_BUNDLE_NAME.to_string());
		new_mom_entries.push(FileRecord::new(Utf8PathBuf::from(INDEX_BUNDLE_NAME), crate::hash::Hashval::ZERO, cfg.version, Flags { file_type: FileType::Manifest, ..Flags::unset() }));
		info!(bundle = INDEX_BUNDLE_NAME, version = cfg.version, "index bundle manifest written");
	} else if let Some(old) = &index_old_manifest {
		new_mom_entries.push(FileRecord::new(Utf8PathBuf::from(INDEX_BUNDLE_NAME), crate::hash::Hashval::ZERO, old.header.version, Flags { file_type: FileType::Manifest, ..Flags::unset() }));
	}

	for f in &index_linked {
		if f.flags.status == Status::Present {
			let existing = full_files.iter_mut().find(|ff| ff.path == f.path);
			match existing {
				Some(existing) if existing.version < f.version => existing.version = f.version,
				Some(_) => {}
				None => full_files.push(f.clone()),
			}
		}
	}

	new_mom_entries.sort_by(|a, b| a.path.cmp(&b.path));

	let full_header = Header {
		format: cfg.format,
		version: cfg.version,
		previous: cfg.previous,
		minversion: cfg.minversion,
		filecount: full_files.len() as u32,
		timestamp: current_build_timestamp(cfg),
		contentsize: full_files.iter().map(|f| f.size.unwrap_or(0)).sum(),
		includes: vec![],
		also_add: vec![],
	};
	full_files.sort_by(|a, b| a.path.cmp(&b.path));
	let full_manifest = Manifest::new(full_header, full_files);
	manifest::write_atomic(&full_manifest, &manifest_path(&cfg.state_dir, cfg.version, FULL_BUNDLE_NAME), registry)?;

	let mom_header = Header {
		format: cfg.format,
		version: cfg.version,
		previous: cfg.previous,
		minversion: cfg.minversion,
		filecount: new_mom_entries.len() as u32,
		timestamp: current_build_timestamp(cfg),
		contentsize: 0,
		includes: vec![],
		also_add: vec![],
	};
	let mom = Manifest::new(mom_header, new_mom_entries);
	manifest::write_atomic(&mom, &manifest_path(&cfg.state_dir, cfg.version, "MoM"), registry)?;

	Ok(BuildOutput { mom, full: full_manifest, written_bundles })
}

/// Builds the `os-core-update-index` body covering every bundle `mom` lists
/// (spec §4.7), reading each bundle's manifest back from disk at the
/// version `mom` actually points it at - so a bundle that didn't change
/// this version (and so wasn't freshly written) is still represented via
/// its carried-forward manifest, not just bundles written this round.
pub fn generate_index_bundle(state_dir: &Utf8Path, mom: &Manifest, registry: &HashRegistry) -> Result<String> {
	let mut manifests = Vec::new();
	for entry in &mom.files {
		let name = entry.path.as_str();
		if name == INDEX_BUNDLE_NAME {
			continue;
		}
		let path = manifest_path(state_dir, entry.version, name);
		let text = fs::read_to_string(path.as_std_path()).map_err(|e| Error::io(path.as_std_path(), e))?;
		manifests.push((name.to_string(), manifest::parse(&text, registry)?));
	}
	Ok(build_index_text(manifests.iter().map(|(n, m)| (n.as_str(), m))))
}

pub fn index_file_path() -> &'static str {
	INDEX_FILE_PATH
}

fn current_build_timestamp(cfg: &BuildConfig) -> i64 {
	cfg.timestamp
}

/// Bundle-cycle handling (spec §8 scenario 5): when bundle X includes Y and
/// Y includes X, any path present under both is subtracted from both and
/// re-attributed to `os-core` so it is not duplicated.
fn deduplicate_cyclic_includes(bundles: &mut [BundleBuild]) {
	let names: Vec<String> = bundles.iter().map(|b| b.name.clone()).collect();
	let include_sets: Vec<HashSet<String>> = bundles.iter().map(|b| b.includes.iter().cloned().collect()).collect();

	let mut cyclic_pairs: Vec<(usize, usize)> = Vec::new();
	for i in 0..names.len() {
		for j in (i + 1)..names.len() {
			if include_sets[i].contains(&names[j]) && include_sets[j].contains(&names[i]) {
				cyclic_pairs.push((i, j));
			}
		}
	}
	if cyclic_pairs.is_empty() {
		return;
	}

	let core_idx = match names.iter().position(|n| n == "os-core") {
		Some(i) => i,
		None => return,
	};

	for (i, j) in cyclic_pairs {
		let shared: HashSet<Utf8PathBuf> = bundles[i].initial.iter().map(|f| f.path.clone()).collect::<HashSet<_>>().intersection(&bundles[j].initial.iter().map(|f| f.path.clone()).collect()).cloned().collect();
		if shared.is_empty() {
			continue;
		}
		for idx in [i, j] {
			if idx == core_idx {
				continue;
			}
			let moved: Vec<FileRecord> = {
				let b = &mut bundles[idx];
				let (keep, move_out): (Vec<_>, Vec<_>) = std::mem::take(&mut b.initial).into_iter().partition(|f| !shared.contains(&f.path));
				b.initial = keep;
				move_out
			};
			for f in moved {
				if !bundles[core_idx].initial.iter().any(|existing| existing.path == f.path) {
					bundles[core_idx].initial.push(f);
				}
			}
		}
	}
	bundles[core_idx].initial.sort_by(|a, b| a.path.cmp(&b.path));
}

/// Injects type-`M` records for every sub-bundle a bundle includes (spec
/// §4.3 step 5, using the bare bundle name as path - the same convention
/// `Manifest.MoM` itself uses for bundle entries), after include resolution
/// has already happened; plus every bundle's own installed-bundle tracking
/// file (spec §8 scenario 1).
fn inject_submanifest_records(bundles: &mut [BundleBuild], version: u32) {
	let names_and_includes: Vec<(String, Vec<String>)> = bundles.iter().map(|b| (b.name.clone(), b.includes.clone())).collect();
	for (i, (name, includes)) in names_and_includes.iter().enumerate() {
		let own_marker = own_bundle_marker_path(name);
		if !bundles[i].initial.iter().any(|f| f.path == own_marker) {
			bundles[i].initial.push(FileRecord::new(own_marker, crate::hash::Hashval::ZERO, version, Flags { file_type: FileType::Regular, ..Flags::unset() }));
		}
		for inc in includes {
			let path = Utf8PathBuf::from(inc.as_str());
			if !bundles[i].initial.iter().any(|f| f.path == path) {
				bundles[i].initial.push(FileRecord::new(path, crate::hash::Hashval::ZERO, version, Flags { file_type: FileType::Manifest, ..Flags::unset() }));
			}
		}
	}
}
