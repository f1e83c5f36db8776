//! End-to-end scenarios from spec §8, driven through `create_manifests`
//! against a real temporary state directory laid out the way §8's "State
//! directory layout" describes.

use camino::Utf8PathBuf;
use swupd_core::build::{create_manifests, BuildConfig};
use swupd_core::hash::HashRegistry;

fn write_groups(state_dir: &Utf8PathBuf, bundles: &[&str]) {
	let mut text = String::new();
	for b in bundles {
		text.push_str(&format!("[{b}]\ngroup={b}\nstatus=ACTIVE\n\n"));
	}
	std::fs::write(state_dir.join("groups.ini"), text).unwrap();
}

fn chroot_dir(state_dir: &Utf8PathBuf, version: u32, bundle: &str) -> Utf8PathBuf {
	state_dir.join("image").join(version.to_string()).join(bundle)
}

fn manifest_text(state_dir: &Utf8PathBuf, version: u32, bundle: &str) -> Option<String> {
	let path = state_dir.join("www").join(version.to_string()).join(format!("Manifest.{bundle}"));
	std::fs::read_to_string(path).ok()
}

fn temp_state_dir() -> (tempfile::TempDir, Utf8PathBuf) {
	let dir = tempfile::tempdir().unwrap();
	let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
	(dir, path)
}

/// Scenario 1: cold start, one bundle.
#[test]
fn cold_start_one_bundle() {
	let (_guard, state_dir) = temp_state_dir();
	write_groups(&state_dir, &["os-core", "test-bundle"]);

	std::fs::create_dir_all(chroot_dir(&state_dir, 10, "os-core")).unwrap();
	let tb = chroot_dir(&state_dir, 10, "test-bundle");
	std::fs::create_dir_all(&tb).unwrap();
	std::fs::write(tb.join("foo"), b"foo").unwrap();

	let registry = HashRegistry::new();
	let cfg = BuildConfig { version: 10, previous: 0, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_000 };
	let out = create_manifests(&cfg, &registry).unwrap();

	let text = manifest_text(&state_dir, 10, "test-bundle").expect("Manifest.test-bundle must be written");
	assert!(text.contains("/foo"), "manifest should list /foo:\n{text}");
	assert!(text.contains("/usr/share/clear/bundles/test-bundle"), "manifest should list its own tracking file:\n{text}");
	assert!(text.contains("includes:\tos-core"), "manifest header should include os-core:\n{text}");

	let mom_names: Vec<&str> = out.mom.files.iter().map(|f| f.path.as_str()).collect();
	assert!(mom_names.contains(&"os-core"));
	assert!(mom_names.contains(&"test-bundle"));
	assert!(out.mom.files.iter().all(|f| f.version == 10));
}

/// Scenario 2: unchanged across versions - no new bundle manifest, MoM
/// carries the old entry forward.
#[test]
fn unchanged_across_versions_carries_mom_entry_forward() {
	let (_guard, state_dir) = temp_state_dir();
	write_groups(&state_dir, &["os-core", "test-bundle"]);

	for version in [10, 20] {
		std::fs::create_dir_all(chroot_dir(&state_dir, version, "os-core")).unwrap();
		let tb = chroot_dir(&state_dir, version, "test-bundle");
		std::fs::create_dir_all(&tb).unwrap();
		std::fs::write(tb.join("foo"), b"foo").unwrap();
	}

	let registry = HashRegistry::new();
	let cfg10 = BuildConfig { version: 10, previous: 0, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_000 };
	create_manifests(&cfg10, &registry).unwrap();

	let cfg20 = BuildConfig { version: 20, previous: 10, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_100 };
	let out20 = create_manifests(&cfg20, &registry).unwrap();

	assert!(manifest_text(&state_dir, 20, "test-bundle").is_none(), "unchanged bundle must not get a new manifest file");

	let tb_entry = out20.mom.files.iter().find(|f| f.path == "test-bundle").expect("MoM must still list test-bundle");
	assert_eq!(tb_entry.version, 10, "carried-forward MoM entry must keep the old version stamp");
}

/// Scenario 3: rename with identical content - old path deleted+linked,
/// new path present+linked, same hash, misc=m on both.
#[test]
fn rename_links_old_and_new_paths() {
	let (_guard, state_dir) = temp_state_dir();
	write_groups(&state_dir, &["os-core", "libs"]);

	std::fs::create_dir_all(chroot_dir(&state_dir, 10, "os-core")).unwrap();
	let libs10 = chroot_dir(&state_dir, 10, "libs");
	std::fs::create_dir_all(libs10.join("lib/py3.6")).unwrap();
	std::fs::write(libs10.join("lib/py3.6/lib.so"), vec![b'x'; 4096]).unwrap();

	let registry = HashRegistry::new();
	let cfg10 = BuildConfig { version: 10, previous: 0, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_000 };
	create_manifests(&cfg10, &registry).unwrap();

	std::fs::create_dir_all(chroot_dir(&state_dir, 20, "os-core")).unwrap();
	let libs20 = chroot_dir(&state_dir, 20, "libs");
	std::fs::create_dir_all(libs20.join("lib/py3.7")).unwrap();
	std::fs::write(libs20.join("lib/py3.7/lib.so"), vec![b'x'; 4096]).unwrap();

	let cfg20 = BuildConfig { version: 20, previous: 10, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_100 };
	create_manifests(&cfg20, &registry).unwrap();

	let text = manifest_text(&state_dir, 20, "libs").expect("Manifest.libs must be written at 20");
	let parsed = swupd_core::manifest::parse(&text, &registry).unwrap();

	let old = parsed.files.iter().find(|f| f.path == "/lib/py3.6/lib.so").expect("old path kept as a record");
	let new = parsed.files.iter().find(|f| f.path == "/lib/py3.7/lib.so").expect("new path present");

	assert!(old.is_deleted());
	assert_eq!(new.flags.status, swupd_core::flags::Status::Present);
	assert_eq!(old.hash, new.hash);
	assert_eq!(old.flags.misc, swupd_core::flags::Misc::MixOrigin);
	assert_eq!(new.flags.misc, swupd_core::flags::Misc::MixOrigin);
}

/// Scenario 5: bundle cycle - X includes Y, Y includes X, a shared path is
/// subtracted from both and moved into os-core.
#[test]
fn bundle_cycle_dedupes_shared_path_into_os_core() {
	let (_guard, state_dir) = temp_state_dir();
	write_groups(&state_dir, &["os-core", "bundle-x", "bundle-y"]);

	std::fs::create_dir_all(chroot_dir(&state_dir, 10, "os-core")).unwrap();

	let x = chroot_dir(&state_dir, 10, "bundle-x");
	std::fs::create_dir_all(x.join("a")).unwrap();
	std::fs::write(x.join("a/b"), b"shared").unwrap();

	let y = chroot_dir(&state_dir, 10, "bundle-y");
	std::fs::create_dir_all(y.join("a")).unwrap();
	std::fs::write(y.join("a/b"), b"shared").unwrap();

	std::fs::write(state_dir.join("image").join("10").join("bundle-x-info"), r#"{"includes": ["bundle-y"]}"#).unwrap();
	std::fs::write(state_dir.join("image").join("10").join("bundle-y-info"), r#"{"includes": ["bundle-x"]}"#).unwrap();

	let registry = HashRegistry::new();
	let cfg = BuildConfig { version: 10, previous: 0, minversion: 0, format: 30, state_dir: state_dir.clone(), workers: 2, timestamp: 1_700_000_000 };
	create_manifests(&cfg, &registry).expect("cyclic includes must not crash the build");

	let x_text = manifest_text(&state_dir, 10, "bundle-x").unwrap();
	let y_text = manifest_text(&state_dir, 10, "bundle-y").unwrap();
	let core_text = manifest_text(&state_dir, 10, "os-core").unwrap();

	assert!(!x_text.contains("/a/b"), "shared path must be subtracted from bundle-x:\n{x_text}");
	assert!(!y_text.contains("/a/b"), "shared path must be subtracted from bundle-y:\n{y_text}");
	assert!(core_text.contains("/a/b"), "shared path must be reattributed to os-core:\n{core_text}");
}

fn regular_flags() -> swupd_core::flags::Flags {
	swupd_core::flags::Flags { file_type: swupd_core::flags::FileType::Regular, ..swupd_core::flags::Flags::unset() }
}

/// Scenario 4: delta too large - a delta that lands no smaller than the
/// compressed fullfile must be rejected rather than shipped.
#[test]
fn delta_rejected_when_larger_than_compressed_fullfile() {
	use swupd_core::manifest::{FileRecord, Header, Manifest};

	let (_guard, state_dir) = temp_state_dir();
	let old_root = state_dir.join("old-root");
	let new_root = state_dir.join("new-root");
	std::fs::create_dir_all(&old_root).unwrap();
	std::fs::create_dir_all(&new_root).unwrap();
	std::fs::write(old_root.join("foo"), "foo".repeat(100)).unwrap();
	std::fs::write(new_root.join("foo"), "asdfghasdf".repeat(10000)).unwrap();

	let registry = HashRegistry::new();
	let old_hash = registry.hash_and_intern(old_root.join("foo").as_std_path()).unwrap();
	let new_hash = registry.hash_and_intern(new_root.join("foo").as_std_path()).unwrap();

	let old = Manifest::new(Header::default(), vec![FileRecord::new(Utf8PathBuf::from("/foo"), old_hash, 10, regular_flags())]);
	let mut new_rec = FileRecord::new(Utf8PathBuf::from("/foo"), new_hash, 20, regular_flags());
	new_rec.size = Some(100_000);
	let new = Manifest::new(Header::default(), vec![new_rec]);

	// force the fullfile-size comparison to reject: a delta between these
	// two strings is never going to beat a 1-byte "compressed fullfile".
	let out_dir = state_dir.join("out");
	let fullfiles_dir = state_dir.join("fullfiles");
	std::fs::create_dir_all(&fullfiles_dir).unwrap();
	std::fs::write(fullfiles_dir.join(format!("{}.tar", registry.hex(new_hash))), b"x").unwrap();

	let deltas = swupd_core::delta::generate_deltas(&old, &new, &old_root, &new_root, &out_dir, &fullfiles_dir, &registry, 1).unwrap();

	assert_eq!(deltas.len(), 1);
	let d = &deltas[0];
	assert!(d.error.is_some(), "oversized delta must be rejected, not shipped");
	assert!(d.error.as_ref().unwrap().contains("not smaller"), "unexpected rejection reason: {:?}", d.error);
	assert!(!d.path.exists(), "rejected delta file must not be left on disk");
}

/// Scenario 6: non-consecutive deltas - a (10→30) pack's delta must encode
/// the actual v30 content, not some value derived through the skipped v20
/// intermediate.
#[test]
fn non_consecutive_deltas_encode_correct_endpoints() {
	use swupd_core::manifest::{FileRecord, Header, Manifest};

	let (_guard, state_dir) = temp_state_dir();
	let registry = HashRegistry::new();

	let mut roots = std::collections::HashMap::new();
	let mut manifests = std::collections::HashMap::new();
	for v in [10u32, 20, 30] {
		let root = state_dir.join(format!("root-{v}"));
		std::fs::create_dir_all(&root).unwrap();
		let content = format!("content-at-version-{v}").repeat(50);
		std::fs::write(root.join("A"), &content).unwrap();
		let hash = registry.hash_and_intern(root.join("A").as_std_path()).unwrap();
		let mut rec = FileRecord::new(Utf8PathBuf::from("/A"), hash, v, regular_flags());
		rec.size = Some(content.len() as u64);
		manifests.insert(v, Manifest::new(Header::default(), vec![rec]));
		roots.insert(v, root);
	}

	let out_dir = state_dir.join("out");
	let fullfiles_dir = state_dir.join("fullfiles");
	std::fs::create_dir_all(&fullfiles_dir).unwrap();

	let run = |from: u32, to: u32| -> swupd_core::delta::Delta {
		let deltas = swupd_core::delta::generate_deltas(&manifests[&from], &manifests[&to], &roots[&from], &roots[&to], &out_dir, &fullfiles_dir, &registry, 1).unwrap();
		assert_eq!(deltas.len(), 1, "{from}->{to} should produce exactly one delta candidate");
		deltas.into_iter().next().unwrap()
	};

	let d10_20 = run(10, 20);
	let d20_30 = run(20, 30);
	let d10_30 = run(10, 30);

	for (d, from, to) in [(&d10_20, 10, 20), (&d20_30, 20, 30), (&d10_30, 10, 30)] {
		assert!(d.error.is_none(), "{from}->{to} delta failed: {:?}", d.error);
		assert_eq!(d.from_version, from);
		assert_eq!(d.to_version, to);
		let expected_name = format!("{from}-{to}-{}-{}", d.from_hash, d.to_hash);
		assert_eq!(d.path.file_name(), Some(expected_name.as_str()));
		assert!(d.path.exists(), "delta file must exist on disk for {from}->{to}");
	}

	// the 10->30 delta's target endpoint is keyed to the real v30 content,
	// not anything derived via the skipped v20 intermediate.
	assert_eq!(d10_30.to_hash, d20_30.to_hash, "10->30 delta must target the actual v30 hash");
	assert_eq!(d10_30.from_hash, d10_20.from_hash, "10->30 delta must originate from the actual v10 hash");
}
