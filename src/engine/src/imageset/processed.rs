//! The set of images a copy run has completed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use imgrelay_core::error::{RelayError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};

use super::UnprocessedImageRef;

/// An image after copy, holding destination-side identifiers.
///
/// Exactly one of `manifest` / `index` is populated, depending on whether
/// the source was a single-architecture image or an image index.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// The source-side entry this image was copied from
    pub unprocessed: UnprocessedImageRef,
    /// Digested reference on the destination side
    pub digest_ref: String,
    /// Manifest of a single-architecture image
    pub manifest: Option<ImageManifest>,
    /// Manifest index of a multi-architecture image
    pub index: Option<ImageIndex>,
}

impl ProcessedImage {
    /// A processed single-architecture image.
    pub fn from_manifest(
        unprocessed: UnprocessedImageRef,
        digest_ref: impl Into<String>,
        manifest: ImageManifest,
    ) -> Self {
        ProcessedImage {
            unprocessed,
            digest_ref: digest_ref.into(),
            manifest: Some(manifest),
            index: None,
        }
    }

    /// A processed multi-architecture image index.
    pub fn from_index(
        unprocessed: UnprocessedImageRef,
        digest_ref: impl Into<String>,
        index: ImageIndex,
    ) -> Self {
        ProcessedImage {
            unprocessed,
            digest_ref: digest_ref.into(),
            manifest: None,
            index: Some(index),
        }
    }
}

/// Thread-safe set of [`ProcessedImage`] entries, keyed like the
/// unprocessed set so both sides of a run line up one-to-one.
#[derive(Debug, Default)]
pub struct ProcessedImages {
    imgs: Mutex<BTreeMap<String, ProcessedImage>>,
}

impl ProcessedImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a processed image. The entry must hold exactly one of
    /// manifest / index.
    pub fn add(&self, img: ProcessedImage) -> Result<()> {
        img.unprocessed.validate()?;
        if img.manifest.is_some() == img.index.is_some() {
            return Err(RelayError::InternalInconsistency(format!(
                "processed image '{}' must hold exactly one of manifest or index",
                img.digest_ref
            )));
        }
        let mut imgs = self.imgs.lock().unwrap();
        imgs.insert(img.unprocessed.key(), img);
        Ok(())
    }

    /// Look up a processed image by its *source* digest reference,
    /// ignoring the tag component of the key.
    pub fn find_by_digest_ref(&self, digest_ref: &str) -> Option<ProcessedImage> {
        let imgs = self.imgs.lock().unwrap();
        let prefix = format!("{}:", digest_ref);
        imgs.range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .next()
    }

    /// Number of entries at the moment of the call.
    pub fn len(&self) -> usize {
        self.imgs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, sorted ascending by destination digest
    /// reference, independent of completion order.
    pub fn all(&self) -> Vec<ProcessedImage> {
        let imgs = self.imgs.lock().unwrap();
        let mut result: Vec<_> = imgs.values().cloned().collect();
        result.sort_by(|a, b| a.digest_ref.cmp(&b.digest_ref));
        result
    }
}
