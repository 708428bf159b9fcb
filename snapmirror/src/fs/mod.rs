//! File tree listing, identity and content fingerprints.

pub mod fingerprint;
pub mod metadata;
pub mod walker;

pub use fingerprint::Fingerprint;
pub use metadata::FileIdentity;
pub use walker::{scan_tree, FileEntry, TreeListing, WalkOptions};
