//! Version diffing: peer-linking, rename detection and post-link heuristics
//! (spec §4.3, §4.5, §4.6).

mod heuristics;
mod peer;
mod rename;

pub use heuristics::apply_heuristics;
pub use peer::{link_peers, PeerLinkStats};
pub use rename::detect_renames;

/// Minimum on-disk size for a file to be considered for delta generation or
/// stripped-name rename pairing (spec §4.5, §4.9).
pub const MIN_DELTA_BYTES: u64 = 200;
