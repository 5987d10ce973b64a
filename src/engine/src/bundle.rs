//! Bundle detection and embedded lockfile rewriting.
//!
//! A bundle is a single-architecture OCI image whose config carries the
//! bundle label and whose layers embed an images lockfile at
//! `.imgpkg/images.yml` declaring the bundle's image dependencies.
//!
//! After a bundle's images have been relocated, the embedded lockfile is
//! rewritten to point at the destination digests, which produces a new
//! layer, a new config, and therefore a new bundle manifest digest.

use std::io::Read;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgrelay_core::error::{RelayError, Result};
use oci_spec::image::ImageConfiguration;

use crate::imageset::{ProcessedImages, UnprocessedImageRef};
use crate::lockconfig::ImagesLock;
use crate::refs::ImageRef;
use crate::registry::{sha256_digest, CachedSource, ParsedManifest, RawManifest};

/// Config label identifying a bundle image.
pub const BUNDLE_LABEL: &str = "dev.carvel.imgpkg.bundle";
/// Label marking the user-seeded bundle among several copied bundles.
pub const ROOT_BUNDLE_LABEL: &str = "dev.carvel.imgpkg.copy.root-bundle";
/// Path of the embedded lockfile inside a bundle layer.
pub const BUNDLE_LOCKFILE_PATH: &str = ".imgpkg/images.yml";

/// Whether a copy-set entry was marked as a bundle during resolution.
pub fn is_bundle_entry(entry: &UnprocessedImageRef) -> bool {
    entry.label_value(BUNDLE_LABEL) == Some("true")
}

/// Whether a copy-set entry is the user-seeded root bundle.
pub fn is_root_bundle_entry(entry: &UnprocessedImageRef) -> bool {
    entry.label_value(ROOT_BUNDLE_LABEL) == Some("true")
}

/// What bundle inspection found inside an image.
#[derive(Debug, Clone)]
pub struct BundleContents {
    /// The embedded lockfile, entry order preserved
    pub lockfile: ImagesLock,
    /// Digest of the layer the lockfile was found in
    pub lockfile_layer_digest: String,
    /// Position of that layer in the manifest
    pub lockfile_layer_index: usize,
    /// Whether the lockfile layer is gzip compressed
    pub gzipped: bool,
}

/// Decide whether the image at `reference` is a bundle, returning its
/// embedded lockfile when it is.
///
/// Image indices are skipped outright: bundles are always
/// single-architecture, so there is nothing to fetch for them.
pub async fn inspect(source: &CachedSource, reference: &ImageRef) -> Result<Option<BundleContents>> {
    let raw = source.get_manifest(reference).await?;
    inspect_manifest(source, reference, &raw).await
}

/// Whether the image carries the bundle label, without touching its
/// layers. Cheap enough for seed-time checks.
pub async fn has_bundle_label(
    source: &CachedSource,
    reference: &ImageRef,
    raw: &RawManifest,
) -> Result<bool> {
    let manifest = match raw.parse()? {
        ParsedManifest::Index(_) => return Ok(false),
        ParsedManifest::Image(manifest) => manifest,
    };

    let config_bytes = source
        .get_blob(reference, manifest.config().digest().as_ref())
        .await?;
    let config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;

    Ok(config
        .config()
        .as_ref()
        .and_then(|c| c.labels().as_ref())
        .and_then(|labels| labels.get(BUNDLE_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false))
}

/// [`inspect`] for a manifest the caller already fetched.
pub async fn inspect_manifest(
    source: &CachedSource,
    reference: &ImageRef,
    raw: &RawManifest,
) -> Result<Option<BundleContents>> {
    let manifest = match raw.parse()? {
        ParsedManifest::Index(_) => return Ok(None),
        ParsedManifest::Image(manifest) => manifest,
    };

    if !has_bundle_label(source, reference, raw).await? {
        return Ok(None);
    }

    for (index, layer) in manifest.layers().iter().enumerate() {
        let digest = layer.digest().to_string();
        let data = source.get_blob(reference, &digest).await?;
        let gzipped = is_gzipped(&data);

        if let Some(lockfile) = read_lockfile_from_layer(&data, gzipped)? {
            return Ok(Some(BundleContents {
                lockfile,
                lockfile_layer_digest: digest,
                lockfile_layer_index: index,
                gzipped,
            }));
        }
    }

    Err(RelayError::Lockfile(format!(
        "bundle '{}' carries the bundle label but no layer contains {}",
        reference, BUNDLE_LOCKFILE_PATH
    )))
}

/// A bundle rebuilt against destination digests, ready to push.
#[derive(Debug, Clone)]
pub struct RewrittenBundle {
    /// The new bundle manifest
    pub manifest: RawManifest,
    /// The new config blob
    pub config: Vec<u8>,
    pub config_digest: String,
    /// The rebuilt lockfile layer blob
    pub layer: Vec<u8>,
    pub layer_digest: String,
    /// Digest of the source layer the rebuilt one replaces
    pub replaced_layer_digest: String,
}

/// Rewrite a bundle's embedded lockfile so every entry points at the
/// digest its image received at the destination.
///
/// Fails with [`RelayError::ImageNotCopied`] if a lockfile entry was never
/// processed. The caller pushes the returned blobs and manifest.
pub async fn rewrite_for_destination(
    source: &CachedSource,
    reference: &ImageRef,
    contents: &BundleContents,
    processed: &ProcessedImages,
) -> Result<RewrittenBundle> {
    let raw = source.get_manifest(reference).await?;

    let mut lockfile = contents.lockfile.clone();
    for entry in &mut lockfile.images {
        let copied = processed.find_by_digest_ref(&entry.image).ok_or_else(|| {
            RelayError::ImageNotCopied {
                reference: entry.image.clone(),
            }
        })?;
        entry.image = copied.digest_ref.clone();
    }
    let lockfile_bytes = lockfile.to_bytes()?;

    let old_layer = source
        .get_blob(reference, &contents.lockfile_layer_digest)
        .await?;
    let (layer, layer_digest, diff_id) =
        rebuild_lockfile_layer(&old_layer, contents.gzipped, &lockfile_bytes)?;

    let config_bytes = {
        let manifest = raw.parse_image()?;
        source
            .get_blob(reference, manifest.config().digest().as_ref())
            .await?
    };
    let (config, config_digest) =
        patch_config(&config_bytes, contents.lockfile_layer_index, &diff_id)?;

    let manifest = patch_manifest(
        &raw,
        contents.lockfile_layer_index,
        &layer_digest,
        layer.len() as u64,
        &config_digest,
        config.len() as u64,
    )?;

    Ok(RewrittenBundle {
        manifest,
        config,
        config_digest,
        layer,
        layer_digest,
        replaced_layer_digest: contents.lockfile_layer_digest.clone(),
    })
}

fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| RelayError::Tar(format!("failed to decompress layer: {}", e)))?;
    Ok(out)
}

fn entry_matches_lockfile(path: &std::path::Path) -> bool {
    path.to_string_lossy().trim_start_matches("./") == BUNDLE_LOCKFILE_PATH
}

/// Search a layer blob for the embedded lockfile.
fn read_lockfile_from_layer(data: &[u8], gzipped: bool) -> Result<Option<ImagesLock>> {
    let plain;
    let tar_bytes: &[u8] = if gzipped {
        plain = decompress(data)?;
        &plain
    } else {
        data
    };

    let mut archive = tar::Archive::new(tar_bytes);
    let entries = archive
        .entries()
        .map_err(|e| RelayError::Tar(format!("failed to read layer entries: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| RelayError::Tar(e.to_string()))?;
        let path = entry.path().map_err(|e| RelayError::Tar(e.to_string()))?;
        if !entry_matches_lockfile(&path) {
            continue;
        }

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| RelayError::Tar(e.to_string()))?;
        return Ok(Some(ImagesLock::from_bytes(&content)?));
    }

    Ok(None)
}

/// Rebuild a lockfile layer with new lockfile content, preserving every
/// other entry byte-for-byte.
///
/// Returns (layer blob, blob digest, uncompressed diff-id).
fn rebuild_lockfile_layer(
    data: &[u8],
    gzipped: bool,
    new_lockfile: &[u8],
) -> Result<(Vec<u8>, String, String)> {
    let plain;
    let tar_bytes: &[u8] = if gzipped {
        plain = decompress(data)?;
        &plain
    } else {
        data
    };

    let mut archive = tar::Archive::new(tar_bytes);
    let mut builder = tar::Builder::new(Vec::new());
    let mut replaced = false;

    let entries = archive
        .entries()
        .map_err(|e| RelayError::Tar(format!("failed to read layer entries: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| RelayError::Tar(e.to_string()))?;
        let is_lockfile = {
            let path = entry.path().map_err(|e| RelayError::Tar(e.to_string()))?;
            entry_matches_lockfile(&path)
        };

        if is_lockfile {
            let mut header = entry.header().clone();
            header.set_size(new_lockfile.len() as u64);
            header.set_cksum();
            builder
                .append(&header, new_lockfile)
                .map_err(|e| RelayError::Tar(e.to_string()))?;
            replaced = true;
        } else {
            let header = entry.header().clone();
            builder
                .append(&header, &mut entry)
                .map_err(|e| RelayError::Tar(e.to_string()))?;
        }
    }

    if !replaced {
        return Err(RelayError::InternalInconsistency(format!(
            "lockfile layer lost its {} entry during rewrite",
            BUNDLE_LOCKFILE_PATH
        )));
    }

    let rebuilt = builder
        .into_inner()
        .map_err(|e| RelayError::Tar(e.to_string()))?;
    let diff_id = sha256_digest(&rebuilt);

    if gzipped {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &rebuilt)?;
        let compressed = encoder
            .finish()
            .map_err(|e| RelayError::Tar(e.to_string()))?;
        let digest = sha256_digest(&compressed);
        Ok((compressed, digest, diff_id))
    } else {
        let digest = diff_id.clone();
        Ok((rebuilt, digest, diff_id))
    }
}

/// Update the diff-id of the rewritten layer in the config blob.
///
/// The config is patched as a JSON value so fields this crate does not
/// model survive untouched.
fn patch_config(config: &[u8], layer_index: usize, diff_id: &str) -> Result<(Vec<u8>, String)> {
    let mut value: serde_json::Value = serde_json::from_slice(config)?;

    let diff_ids = value
        .pointer_mut("/rootfs/diff_ids")
        .and_then(|d| d.as_array_mut())
        .ok_or_else(|| {
            RelayError::InternalInconsistency("bundle config has no rootfs.diff_ids".to_string())
        })?;
    let slot = diff_ids.get_mut(layer_index).ok_or_else(|| {
        RelayError::InternalInconsistency(format!(
            "bundle config has no diff_id at layer index {}",
            layer_index
        ))
    })?;
    *slot = serde_json::Value::String(diff_id.to_string());

    let bytes = serde_json::to_vec(&value)?;
    let digest = sha256_digest(&bytes);
    Ok((bytes, digest))
}

/// Update the lockfile layer and config descriptors in the manifest.
fn patch_manifest(
    raw: &RawManifest,
    layer_index: usize,
    layer_digest: &str,
    layer_size: u64,
    config_digest: &str,
    config_size: u64,
) -> Result<RawManifest> {
    let mut value: serde_json::Value = serde_json::from_slice(&raw.bytes)?;

    let layer = value
        .pointer_mut(&format!("/layers/{}", layer_index))
        .ok_or_else(|| {
            RelayError::InternalInconsistency(format!(
                "bundle manifest has no layer at index {}",
                layer_index
            ))
        })?;
    layer["digest"] = serde_json::Value::String(layer_digest.to_string());
    layer["size"] = serde_json::Value::from(layer_size);

    let config = value.pointer_mut("/config").ok_or_else(|| {
        RelayError::InternalInconsistency("bundle manifest has no config descriptor".to_string())
    })?;
    config["digest"] = serde_json::Value::String(config_digest.to_string());
    config["size"] = serde_json::Value::from(config_size);

    let bytes = serde_json::to_vec(&value)?;
    Ok(RawManifest::from_bytes(bytes, raw.media_type.clone()))
}
