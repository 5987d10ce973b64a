//! Closure resolution: from a copy seed to the full set of images to
//! copy.
//!
//! Seeding converts the origin (single image, bundle, lock file, or tar
//! archive) into initial entries. Expansion then walks outward in waves
//! on the worker pool: bundles contribute their lockfile images, image
//! indices contribute their children, and the configured signature
//! fetcher contributes signature artifacts. Cycles break on set
//! membership.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use imgrelay_core::error::{RelayError, Result};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::bundle::{self, BUNDLE_LABEL, ROOT_BUNDLE_LABEL};
use crate::imageset::{UnprocessedImageRef, UnprocessedImageRefs};
use crate::lockconfig::Lock;
use crate::refs::ImageRef;
use crate::registry::{CachedSource, ParsedManifest};
use crate::signature::SignatureFetcher;
use crate::tarset::TarImageSource;

/// What a copy run starts from. Exactly one origin, by construction.
#[derive(Debug, Clone)]
pub enum CopySource {
    /// A single image reference
    Image(String),
    /// A bundle reference; its closure is copied
    Bundle(String),
    /// An ImagesLock or BundleLock file on disk
    Lockfile(PathBuf),
    /// An image set archive produced by an earlier copy
    Tar(PathBuf),
}

/// Resolves the transitive closure of a copy origin.
pub struct Resolver {
    source: Arc<CachedSource>,
    signatures: Arc<dyn SignatureFetcher>,
    concurrency: usize,
    cancel: watch::Receiver<bool>,
}

/// One unit of expansion work.
struct Candidate {
    entry: UnprocessedImageRef,
    /// Bundle detection applies; index children are enumerated but never
    /// checked for bundle-ness
    detect_bundle: bool,
}

/// What expanding one entry discovered.
struct Expansion {
    /// The entry re-labelled as a bundle, when detection fired
    relabelled: Option<UnprocessedImageRef>,
    children: Vec<Candidate>,
    signatures: Vec<UnprocessedImageRef>,
}

impl Resolver {
    pub fn new(
        source: Arc<CachedSource>,
        signatures: Arc<dyn SignatureFetcher>,
        concurrency: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Resolver {
            source,
            signatures,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Produce the fully populated set of images the copy must move.
    pub async fn resolve(&self, origin: &CopySource) -> Result<UnprocessedImageRefs> {
        let seeds = self.seed(origin).await?;
        // An archive already contains any signatures the copy that
        // produced it collected
        let fetch_signatures = !matches!(origin, CopySource::Tar(_));

        let refs = UnprocessedImageRefs::new();
        let mut known_digest_refs: HashSet<String> = HashSet::new();
        let mut frontier = Vec::with_capacity(seeds.len());

        for seed in seeds {
            known_digest_refs.insert(seed.digest_ref.clone());
            refs.add(seed.clone())?;
            frontier.push(Candidate {
                entry: seed,
                detect_bundle: true,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        while !frontier.is_empty() {
            self.check_cancelled()?;

            let mut tasks = JoinSet::new();
            for candidate in frontier.drain(..) {
                let source = Arc::clone(&self.source);
                let signatures = Arc::clone(&self.signatures);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        RelayError::InternalInconsistency("resolver semaphore closed".to_string())
                    })?;
                    expand(&source, signatures.as_ref(), candidate, fetch_signatures).await
                });
            }

            let mut next = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let expansion = joined.map_err(|e| {
                    RelayError::InternalInconsistency(format!("resolver task panicked: {}", e))
                })??;

                if let Some(relabelled) = expansion.relabelled {
                    refs.add(relabelled)?;
                }
                for signature in expansion.signatures {
                    if refs.contains(&signature.key()) {
                        continue;
                    }
                    known_digest_refs.insert(signature.digest_ref.clone());
                    refs.add(signature)?;
                }
                for child in expansion.children {
                    if refs.contains(&child.entry.key()) {
                        continue;
                    }
                    // An untagged rediscovery of a digest loses to an
                    // entry that already carries a tag
                    if child.entry.tag.is_empty()
                        && known_digest_refs.contains(&child.entry.digest_ref)
                    {
                        continue;
                    }
                    known_digest_refs.insert(child.entry.digest_ref.clone());
                    refs.add(child.entry.clone())?;
                    next.push(child);
                }
            }
            frontier = next;
        }

        tracing::info!(images = refs.len(), "Resolved image closure");
        Ok(refs)
    }

    /// Convert the origin into the initial entries.
    async fn seed(&self, origin: &CopySource) -> Result<Vec<UnprocessedImageRef>> {
        match origin {
            CopySource::Image(reference) => {
                let seed = self.seed_reference(reference, "").await?;
                if self.seed_is_bundle(&seed).await? {
                    return Err(RelayError::PlainImageExpected {
                        reference: reference.clone(),
                    });
                }
                Ok(vec![seed])
            }
            CopySource::Bundle(reference) => {
                let seed = self.seed_reference(reference, "").await?;
                if !self.seed_is_bundle(&seed).await? {
                    return Err(RelayError::BundleExpected {
                        reference: reference.clone(),
                    });
                }
                Ok(vec![seed
                    .with_label(BUNDLE_LABEL, "true")
                    .with_label(ROOT_BUNDLE_LABEL, "true")])
            }
            CopySource::Lockfile(path) => match Lock::from_path(path)? {
                Lock::Images(lock) => {
                    let mut seeds = Vec::with_capacity(lock.images.len());
                    for image in &lock.images {
                        seeds.push(UnprocessedImageRef::new(image.image.clone(), "")?);
                    }
                    Ok(seeds)
                }
                Lock::Bundle(lock) => {
                    let seed = self
                        .seed_reference(&lock.bundle.image, &lock.bundle.tag)
                        .await?;
                    if !self.seed_is_bundle(&seed).await? {
                        return Err(RelayError::BundleExpected {
                            reference: lock.bundle.image.clone(),
                        });
                    }
                    Ok(vec![seed
                        .with_label(BUNDLE_LABEL, "true")
                        .with_label(ROOT_BUNDLE_LABEL, "true")])
                }
            },
            CopySource::Tar(path) => {
                let archive = TarImageSource::open(path)?;
                archive.entries()
            }
        }
    }

    /// Build a seed entry from a user-supplied reference, resolving a
    /// floating tag to a digest exactly once.
    async fn seed_reference(&self, reference: &str, fallback_tag: &str) -> Result<UnprocessedImageRef> {
        let parsed = ImageRef::parse(reference)?;

        let digest = match parsed.digest.as_deref() {
            Some(digest) => digest.to_string(),
            None => {
                let raw = self.source.get_manifest(&parsed).await.map_err(|e| {
                    RelayError::UnreachableAncestor {
                        reference: reference.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                raw.digest.clone()
            }
        };

        let tag = parsed
            .tag
            .clone()
            .unwrap_or_else(|| fallback_tag.to_string());
        let entry = UnprocessedImageRef::new(parsed.with_digest(&digest).digest_ref()?, tag)?
            .with_orig_ref(reference);
        Ok(entry)
    }

    async fn seed_is_bundle(&self, seed: &UnprocessedImageRef) -> Result<bool> {
        let src_ref = ImageRef::parse_digested(&seed.digest_ref)?;
        let raw = self.source.get_manifest(&src_ref).await.map_err(|e| {
            RelayError::UnreachableAncestor {
                reference: seed.digest_ref.clone(),
                reason: e.to_string(),
            }
        })?;
        bundle::has_bundle_label(&self.source, &src_ref, &raw).await
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(RelayError::Cancelled);
        }
        Ok(())
    }
}

/// Expand one candidate: enumerate index children, detect bundle-ness
/// and collect lockfile images, and fetch signature artifacts.
async fn expand(
    source: &Arc<CachedSource>,
    signatures: &dyn SignatureFetcher,
    candidate: Candidate,
    fetch_signatures: bool,
) -> Result<Expansion> {
    let entry = candidate.entry;
    let src_ref = ImageRef::parse_digested(&entry.digest_ref)?;

    let raw = source
        .get_manifest(&src_ref)
        .await
        .map_err(|e| RelayError::UnreachableAncestor {
            reference: entry.digest_ref.clone(),
            reason: e.to_string(),
        })?;

    let mut expansion = Expansion {
        relabelled: None,
        children: Vec::new(),
        signatures: Vec::new(),
    };

    match raw.parse()? {
        ParsedManifest::Index(index) => {
            for descriptor in index.manifests() {
                let child_ref = src_ref.with_digest(descriptor.digest().as_ref());
                let child = UnprocessedImageRef::new(child_ref.digest_ref()?, "")?;
                expansion.children.push(Candidate {
                    entry: child,
                    detect_bundle: false,
                });
            }
        }
        ParsedManifest::Image(_) if candidate.detect_bundle => {
            if let Some(contents) = bundle::inspect_manifest(source, &src_ref, &raw).await? {
                expansion.relabelled = Some(entry.clone().with_label(BUNDLE_LABEL, "true"));
                for image in &contents.lockfile.images {
                    let child = UnprocessedImageRef::new(image.image.clone(), "")?;
                    expansion.children.push(Candidate {
                        entry: child,
                        detect_bundle: true,
                    });
                }
            }
        }
        ParsedManifest::Image(_) => {}
    }

    if fetch_signatures {
        expansion.signatures = signatures.fetch(&src_ref).await?;
    }
    Ok(expansion)
}
