//! Bounded-concurrency transfer of an image set to a destination
//! repository.
//!
//! Plain images copy in one fan-out wave. Bundles copy afterwards in
//! dependency order, because rewriting a bundle's embedded lockfile
//! needs the destination digests of its images. Within any one image,
//! the manifest push strictly follows its blob pushes, and an index push
//! strictly follows its children.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use imgrelay_core::error::{RelayError, Result};
use oci_spec::image::ImageManifest;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::bundle::{self, BundleContents};
use crate::imageset::{ProcessedImage, ProcessedImages, UnprocessedImageRef, UnprocessedImageRefs};
use crate::refs::ImageRef;
use crate::registry::{CachedSource, ParsedManifest, RawManifest, Registry};
use crate::tags::TagGenerator;

/// A layer that was not copied because of its media type.
#[derive(Debug, Clone)]
pub struct SkippedLayer {
    /// Digest reference of the image the layer belongs to
    pub image: String,
    pub digest: String,
    pub media_type: String,
}

/// Whether a layer media type marks it as legally non-redistributable.
pub fn is_non_distributable(media_type: &str) -> bool {
    media_type.contains("nondistributable") || media_type.contains("rootfs.foreign")
}

/// Transfer tuning knobs.
#[derive(Debug, Clone)]
pub struct TransferOpts {
    /// Maximum in-flight blob operations
    pub concurrency: usize,
    /// Copy non-distributable layers instead of skipping them
    pub include_non_distributable: bool,
}

/// Copies an [`UnprocessedImageRefs`] set into a single destination
/// repository.
pub struct TransferEngine {
    source: Arc<CachedSource>,
    destination: Arc<dyn Registry>,
    dest_repo: ImageRef,
    tag_generator: Arc<dyn TagGenerator>,
    opts: TransferOpts,
    cancel: watch::Receiver<bool>,
    semaphore: Semaphore,
    // digest -> per-blob completion lock; a single destination repository
    // per run, so the digest alone identifies the blob
    blob_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
    skipped: Mutex<Vec<SkippedLayer>>,
}

impl TransferEngine {
    pub fn new(
        source: Arc<CachedSource>,
        destination: Arc<dyn Registry>,
        dest_repo: ImageRef,
        tag_generator: Arc<dyn TagGenerator>,
        opts: TransferOpts,
        cancel: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let permits = opts.concurrency.max(1);
        Arc::new(TransferEngine {
            source,
            destination,
            dest_repo,
            tag_generator,
            opts,
            cancel,
            semaphore: Semaphore::new(permits),
            blob_locks: Mutex::new(HashMap::new()),
            skipped: Mutex::new(Vec::new()),
        })
    }

    /// Copy every entry of the set, returning the processed images and
    /// the descriptors of skipped non-distributable layers.
    pub async fn copy_images(
        self: &Arc<Self>,
        refs: &UnprocessedImageRefs,
    ) -> Result<(ProcessedImages, Vec<SkippedLayer>)> {
        let processed = Arc::new(ProcessedImages::new());

        let (bundles, plain): (Vec<_>, Vec<_>) =
            refs.all().into_iter().partition(bundle::is_bundle_entry);

        tracing::info!(
            images = plain.len(),
            bundles = bundles.len(),
            destination = %self.dest_repo,
            "Starting transfer"
        );

        self.copy_plain_images(plain, &processed).await?;
        self.copy_bundles(bundles, &processed).await?;

        let skipped = self.skipped.lock().unwrap().clone();
        let processed = Arc::try_unwrap(processed).map_err(|_| {
            RelayError::InternalInconsistency("processed set still shared after run".to_string())
        })?;
        Ok((processed, skipped))
    }

    async fn copy_plain_images(
        self: &Arc<Self>,
        entries: Vec<UnprocessedImageRef>,
        processed: &Arc<ProcessedImages>,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for entry in entries {
            let engine = Arc::clone(self);
            let processed = Arc::clone(processed);
            tasks.spawn(async move { engine.copy_image(entry, &processed).await });
        }
        drain(tasks).await
    }

    /// Copy bundles children-first. Every lockfile entry of a bundle is
    /// part of the copy set, so each pass completes at least one bundle
    /// unless the set is inconsistent.
    async fn copy_bundles(
        self: &Arc<Self>,
        entries: Vec<UnprocessedImageRef>,
        processed: &Arc<ProcessedImages>,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            self.check_cancelled()?;
            let src_ref = ImageRef::parse_digested(&entry.digest_ref)?;
            let contents = bundle::inspect(&self.source, &src_ref).await?.ok_or_else(|| {
                RelayError::InternalInconsistency(format!(
                    "'{}' should be a bundle but it is not",
                    entry.digest_ref
                ))
            })?;
            pending.push((entry, src_ref, contents));
        }

        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, _, contents)| {
                    contents
                        .lockfile
                        .images
                        .iter()
                        .all(|img| processed.find_by_digest_ref(&img.image).is_some())
                });

            if ready.is_empty() {
                return Err(RelayError::InternalInconsistency(
                    "bundle dependencies never completed; lockfiles form a cycle".to_string(),
                ));
            }

            let mut tasks = JoinSet::new();
            for (entry, src_ref, contents) in ready {
                let engine = Arc::clone(self);
                let processed = Arc::clone(processed);
                tasks.spawn(async move {
                    engine.copy_bundle(entry, src_ref, contents, &processed).await
                });
            }
            drain(tasks).await?;

            pending = blocked;
        }
        Ok(())
    }

    async fn copy_image(
        self: &Arc<Self>,
        entry: UnprocessedImageRef,
        processed: &Arc<ProcessedImages>,
    ) -> Result<()> {
        self.check_cancelled()?;

        let src_ref = ImageRef::parse_digested(&entry.digest_ref)?;
        let raw = self.source.get_manifest(&src_ref).await?;

        self.copy_tree(&src_ref, &raw, &entry.digest_ref).await?;

        let tag = self.destination_tag(&entry, &raw.digest)?;
        self.push_manifest(&raw, Some(&tag)).await?;

        let digest_ref = self.destination_digest_ref(&raw.digest);
        let image = match raw.parse()? {
            ParsedManifest::Image(manifest) => {
                ProcessedImage::from_manifest(entry, digest_ref, manifest)
            }
            ParsedManifest::Index(index) => ProcessedImage::from_index(entry, digest_ref, index),
        };
        processed.add(image)?;
        Ok(())
    }

    /// Copy all blobs a manifest reaches. For an index this pushes the
    /// child manifests as well, children before parents; the caller
    /// pushes the top manifest last.
    fn copy_tree<'a>(
        self: &'a Arc<Self>,
        src_ref: &'a ImageRef,
        raw: &'a RawManifest,
        origin: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match raw.parse()? {
                ParsedManifest::Image(manifest) => {
                    self.copy_image_blobs(src_ref, &manifest, origin).await
                }
                ParsedManifest::Index(index) => {
                    for descriptor in index.manifests() {
                        let child_ref = src_ref.with_digest(descriptor.digest().as_ref());
                        let child = self.source.get_manifest(&child_ref).await?;
                        self.copy_tree(&child_ref, &child, origin).await?;
                        self.push_manifest(&child, None).await?;
                    }
                    Ok(())
                }
            }
        })
    }

    async fn copy_image_blobs(
        self: &Arc<Self>,
        src_ref: &ImageRef,
        manifest: &ImageManifest,
        origin: &str,
    ) -> Result<()> {
        self.copy_blob(src_ref, manifest.config().digest().as_ref())
            .await?;

        for layer in manifest.layers() {
            let media_type = layer.media_type().to_string();
            if is_non_distributable(&media_type) && !self.opts.include_non_distributable {
                tracing::warn!(
                    image = %origin,
                    digest = %layer.digest(),
                    media_type = %media_type,
                    "Skipped non-distributable layer"
                );
                self.skipped.lock().unwrap().push(SkippedLayer {
                    image: origin.to_string(),
                    digest: layer.digest().to_string(),
                    media_type,
                });
                continue;
            }
            self.copy_blob(src_ref, layer.digest().as_ref()).await?;
        }
        Ok(())
    }

    async fn copy_bundle(
        self: &Arc<Self>,
        entry: UnprocessedImageRef,
        src_ref: ImageRef,
        contents: BundleContents,
        processed: &Arc<ProcessedImages>,
    ) -> Result<()> {
        self.check_cancelled()?;

        let rewritten =
            bundle::rewrite_for_destination(&self.source, &src_ref, &contents, processed).await?;

        // Untouched layers come across as-is; the lockfile layer and the
        // config are replaced by the rewritten blobs
        let original = self.source.get_manifest(&src_ref).await?.parse_image()?;
        for layer in original.layers() {
            let digest = layer.digest().to_string();
            if digest == rewritten.replaced_layer_digest {
                continue;
            }
            let media_type = layer.media_type().to_string();
            if is_non_distributable(&media_type) && !self.opts.include_non_distributable {
                tracing::warn!(
                    image = %entry.digest_ref,
                    digest = %digest,
                    media_type = %media_type,
                    "Skipped non-distributable layer"
                );
                self.skipped.lock().unwrap().push(SkippedLayer {
                    image: entry.digest_ref.clone(),
                    digest,
                    media_type,
                });
                continue;
            }
            self.copy_blob(&src_ref, &digest).await?;
        }

        self.put_blob_bytes(&rewritten.layer_digest, rewritten.layer.clone())
            .await?;
        self.put_blob_bytes(&rewritten.config_digest, rewritten.config.clone())
            .await?;

        let tag = self.destination_tag(&entry, &rewritten.manifest.digest)?;
        self.push_manifest(&rewritten.manifest, Some(&tag)).await?;

        let digest_ref = self.destination_digest_ref(&rewritten.manifest.digest);
        let manifest = rewritten.manifest.parse_image()?;
        processed.add(ProcessedImage::from_manifest(entry, digest_ref, manifest))?;
        Ok(())
    }

    /// Copy one blob from source to destination, deduplicating by digest
    /// and preferring a cross-repo mount when both sides share a host.
    async fn copy_blob(self: &Arc<Self>, src_ref: &ImageRef, digest: &str) -> Result<()> {
        self.check_cancelled()?;

        let blob_lock = self.blob_lock(digest);
        let mut done = blob_lock.lock().await;
        if *done {
            return Ok(());
        }

        let _permit = self.acquire_permit().await?;

        if self.destination.has_blob(&self.dest_repo, digest).await? {
            tracing::debug!(digest = %digest, "Blob already at destination");
            *done = true;
            return Ok(());
        }

        let mount_eligible =
            src_ref.registry == self.dest_repo.registry && self.source.inner().supports_mount();
        if mount_eligible
            && self
                .destination
                .mount_blob(&self.dest_repo, &src_ref.repository, digest)
                .await?
        {
            *done = true;
            return Ok(());
        }

        let data = self.source.get_blob(src_ref, digest).await?;
        self.destination
            .put_blob(&self.dest_repo, digest, data)
            .await?;
        *done = true;
        Ok(())
    }

    /// Upload locally produced blob bytes (rewritten bundle content).
    async fn put_blob_bytes(self: &Arc<Self>, digest: &str, data: Vec<u8>) -> Result<()> {
        self.check_cancelled()?;

        let blob_lock = self.blob_lock(digest);
        let mut done = blob_lock.lock().await;
        if *done {
            return Ok(());
        }

        let _permit = self.acquire_permit().await?;
        if !self.destination.has_blob(&self.dest_repo, digest).await? {
            self.destination
                .put_blob(&self.dest_repo, digest, data)
                .await?;
        }
        *done = true;
        Ok(())
    }

    async fn push_manifest(&self, raw: &RawManifest, tag: Option<&str>) -> Result<()> {
        self.check_cancelled()?;
        let _permit = self.acquire_permit().await?;

        let reference = match tag {
            Some(tag) => self.dest_repo.with_tag(tag),
            None => self.dest_repo.with_digest(&raw.digest),
        };
        self.destination.put_manifest(&reference, raw).await
    }

    fn blob_lock(&self, digest: &str) -> Arc<tokio::sync::Mutex<bool>> {
        let mut locks = self.blob_locks.lock().unwrap();
        Arc::clone(locks.entry(digest.to_string()).or_default())
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore.acquire().await.map_err(|_| {
            RelayError::InternalInconsistency("transfer semaphore closed".to_string())
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(RelayError::Cancelled);
        }
        Ok(())
    }

    fn destination_tag(&self, entry: &UnprocessedImageRef, dest_digest: &str) -> Result<String> {
        crate::tags::destination_tag(self.tag_generator.as_ref(), entry, dest_digest)
    }

    fn destination_digest_ref(&self, digest: &str) -> String {
        format!(
            "{}/{}@{}",
            self.dest_repo.registry, self.dest_repo.repository, digest
        )
    }
}

/// Await every task, surfacing the first failure after all tasks have
/// settled so in-flight operations run to completion.
async fn drain(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| {
            RelayError::InternalInconsistency(format!("transfer task panicked: {}", e))
        });
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_non_distributable() {
        assert!(is_non_distributable(
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
        ));
        assert!(is_non_distributable(
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
        ));
        assert!(!is_non_distributable(
            "application/vnd.oci.image.layer.v1.tar+gzip"
        ));
    }

    #[tokio::test]
    async fn test_drain_reports_first_error_after_settling() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async { Err(RelayError::Cancelled) });
        tasks.spawn(async { Ok(()) });

        let err = drain(tasks).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
