//! Tar archives as a portable image set representation.
//!
//! An archive holds one file per unique blob under `blobs/sha256/<hex>`
//! plus a `manifest.json` index mapping each image to its manifest,
//! config, and layer blobs. Manifests and configs are stored as blobs
//! like any layer, so pushing from a tar preserves digests exactly.
//!
//! `manifest.json` is written last: a crash mid-write leaves an archive
//! the resume path can finish, and a complete index marks a complete
//! archive.

mod read;
mod write;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use read::TarImageSource;
pub use write::{write_image_set, TarWriteOpts, TarWriteSummary};

/// Name of the index file inside the archive.
pub const TAR_INDEX_NAME: &str = "manifest.json";

/// Path of a blob inside the archive.
pub fn blob_path(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("blobs/sha256/{}", hex)
}

/// Digest of a blob entry path, if the path is one.
pub fn digest_from_blob_path(path: &str) -> Option<String> {
    let hex = path.strip_prefix("blobs/sha256/")?;
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("sha256:{}", hex))
    } else {
        None
    }
}

/// One blob referenced by an archived image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarBlobRef {
    pub digest: String,
    pub path: String,
}

/// One image recorded in the archive index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarImageEntry {
    /// Source digest reference (`registry/repo@sha256:...`)
    pub image: String,
    /// Manifest digest
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// Labels carried from the copy set (bundle markers among them)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub manifest_path: String,
    /// Empty for image indices, which have no config
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_path: String,
    /// Layer blobs; for indices this lists the child manifest blobs
    #[serde(default)]
    pub layers: Vec<TarBlobRef>,
}

/// The archive index stored as `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarIndex {
    pub images: Vec<TarImageEntry>,
}
