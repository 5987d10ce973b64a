//! Lock output after a successful copy to a repository.
//!
//! A run that copied a root bundle emits a `BundleLock`; otherwise an
//! `ImagesLock` lists the destination digests. Pre-marker archives that
//! contain a bundle but no root marker fail loudly instead of guessing.

use std::path::Path;
use std::sync::Arc;

use imgrelay_core::error::{RelayError, Result};

use crate::bundle::{self, is_root_bundle_entry};
use crate::imageset::{ProcessedImage, ProcessedImages};
use crate::lockconfig::{BundleLock, ImageRefLock, ImagesLock};
use crate::refs::ImageRef;
use crate::registry::CachedSource;
use crate::tags::{destination_tag, TagGenerator};

/// Write the lock file describing what the copy produced.
///
/// `input_lock` carries the user-supplied ImagesLock when the run started
/// from one; its entry order is preserved in the output.
pub async fn write_lock_output(
    path: &Path,
    processed: &ProcessedImages,
    destination: &Arc<CachedSource>,
    input_lock: Option<&ImagesLock>,
    tag_generator: &dyn TagGenerator,
) -> Result<()> {
    match find_root_bundle(processed)? {
        Some(root) => {
            write_bundle_lock(path, &root, destination, tag_generator).await?;
        }
        None => {
            fail_if_bundle_without_marker(processed, destination).await?;
            write_images_lock(path, processed, input_lock)?;
        }
    }

    tracing::info!(path = %path.display(), "Wrote lock output");
    Ok(())
}

/// Locate the processed image marked as the root bundle. More than one
/// marker is an invariant violation.
fn find_root_bundle(processed: &ProcessedImages) -> Result<Option<ProcessedImage>> {
    let mut root = None;
    for image in processed.all() {
        if !is_root_bundle_entry(&image.unprocessed) {
            continue;
        }
        if root.is_some() {
            return Err(RelayError::InternalInconsistency(
                "expected only one root bundle".to_string(),
            ));
        }
        root = Some(image);
    }
    Ok(root)
}

async fn write_bundle_lock(
    path: &Path,
    root: &ProcessedImage,
    destination: &Arc<CachedSource>,
    tag_generator: &dyn TagGenerator,
) -> Result<()> {
    // An index can never be a bundle, marker or not
    if root.index.is_some() {
        return Err(RelayError::InternalInconsistency(format!(
            "'{}' should be a bundle but it is not",
            root.digest_ref
        )));
    }

    // The marker may be stale; trust the destination manifest
    let dst_ref = ImageRef::parse_digested(&root.digest_ref)?;
    let raw = destination.get_manifest(&dst_ref).await?;
    if !bundle::has_bundle_label(destination, &dst_ref, &raw).await? {
        return Err(RelayError::InternalInconsistency(format!(
            "'{}' should be a bundle but it is not",
            root.digest_ref
        )));
    }

    let dest_digest = dst_ref.digest.as_deref().unwrap_or_default();
    let tag = destination_tag(tag_generator, &root.unprocessed, dest_digest)?;

    BundleLock::new(root.digest_ref.clone(), tag).write_to_path(path)
}

/// An archive created before root bundles were labelled can contain a
/// bundle with no marker; the right lock kind is then unknowable.
async fn fail_if_bundle_without_marker(
    processed: &ProcessedImages,
    destination: &Arc<CachedSource>,
) -> Result<()> {
    for image in processed.all() {
        // Indices are never bundles, skip the manifest fetch
        if image.index.is_some() {
            continue;
        }
        let dst_ref = ImageRef::parse_digested(&image.digest_ref)?;
        let raw = destination.get_manifest(&dst_ref).await?;
        if bundle::has_bundle_label(destination, &dst_ref, &raw).await? {
            return Err(RelayError::RootBundleIndeterminate);
        }
    }
    Ok(())
}

fn write_images_lock(
    path: &Path,
    processed: &ProcessedImages,
    input_lock: Option<&ImagesLock>,
) -> Result<()> {
    let lock = match input_lock {
        Some(input) => {
            let mut lock = input.clone();
            for entry in &mut lock.images {
                let copied = processed.find_by_digest_ref(&entry.image).ok_or_else(|| {
                    RelayError::ImageNotCopied {
                        reference: entry.image.clone(),
                    }
                })?;
                entry.image = copied.digest_ref.clone();
            }
            lock
        }
        None => {
            let mut lock = ImagesLock::new();
            for image in processed.all() {
                lock.images.push(ImageRefLock {
                    image: image.digest_ref.clone(),
                    annotations: Default::default(),
                });
            }
            lock
        }
    };

    lock.write_to_path(path)
}
