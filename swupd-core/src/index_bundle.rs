//! The synthetic `os-core-update-index` bundle (spec §4.7): a text index
//! mapping every present non-directory path to its owning bundle.

use camino::Utf8PathBuf;

use crate::flags::{FileType, Status};
use crate::manifest::Manifest;

pub const INDEX_BUNDLE_NAME: &str = "os-core-update-index";
pub const INDEX_FILE_PATH: &str = "/usr/share/clear/os-core-update-index";

/// One line of the generated index: the owning bundle's name and its
/// manifest `contentsize`, used only to break ties when sorting.
struct OwningBundle<'a> {
	name: &'a str,
	contentsize: u64,
}

/// Builds the index file body: one `<path>\t<bundle>` line per present,
/// non-directory path across all bundle manifests, sorted by (path,
/// owning-bundle-contentsize).
pub fn build_index_text<'a>(bundles: impl IntoIterator<Item = (&'a str, &'a Manifest)>) -> String {
	let mut rows: Vec<(&Utf8PathBuf, OwningBundle)> = Vec::new();

	for (name, manifest) in bundles {
		let contentsize = manifest.header.contentsize;
		for f in &manifest.files {
			if f.flags.status != Status::Present {
				continue;
			}
			if f.flags.file_type == FileType::Directory {
				continue;
			}
			rows.push((&f.path, OwningBundle { name, contentsize }));
		}
	}

	rows.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.contentsize.cmp(&b.1.contentsize)));

	let mut out = String::new();
	for (path, owner) in rows {
		out.push_str(path.as_str());
		out.push('\t');
		out.push_str(owner.name);
		out.push('\n');
	}
	out
}
