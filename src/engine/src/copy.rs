//! Copy orchestration.
//!
//! Validates the source/destination combination, resolves the closure,
//! runs the transfer engine or the tar writer, and emits the lock
//! output. Phases are strictly sequential; fan-out happens inside them.

use std::path::PathBuf;
use std::sync::Arc;

use imgrelay_core::error::{RelayError, Result};
use tokio::sync::watch;

use crate::lockconfig::Lock;
use crate::refs::ImageRef;
use crate::registry::{CachedSource, Registry};
use crate::resolver::{CopySource, Resolver};
use crate::signature::SignatureFetcher;
use crate::tags::{DefaultTagGenerator, RepoBasedTagGenerator, TagGenerator};
use crate::tarset::{self, TarWriteOpts};
use crate::transfer::{SkippedLayer, TransferEngine, TransferOpts};
use crate::{lockoutput, tarset::TarImageSource};

/// Default bound on in-flight blob operations.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Where a copy run delivers to. Exactly one destination, by
/// construction.
#[derive(Debug, Clone)]
pub enum CopyDestination {
    /// A destination repository (`registry/repo`)
    Repo(String),
    /// An image set archive on disk
    Tar(PathBuf),
}

/// Copy run options.
#[derive(Debug, Clone)]
pub struct CopyOpts {
    /// Maximum in-flight blob operations
    pub concurrency: usize,
    /// Copy non-distributable layers instead of skipping them
    pub include_non_distributable: bool,
    /// Name destination tags after the source repository path
    pub use_repo_based_tags: bool,
    /// Skip blobs already present in an existing tar destination
    pub resume: bool,
    /// Write an ImagesLock/BundleLock here after a repository copy
    pub lock_output: Option<PathBuf>,
}

impl Default for CopyOpts {
    fn default() -> Self {
        CopyOpts {
            concurrency: DEFAULT_CONCURRENCY,
            include_non_distributable: false,
            use_repo_based_tags: false,
            resume: false,
            lock_output: None,
        }
    }
}

/// User-visible outcome of a copy run.
#[derive(Debug)]
pub struct CopySummary {
    /// Images delivered to the destination
    pub image_count: usize,
    /// Where they went, for display
    pub destination: String,
    /// Lock file written, when requested
    pub lock_output: Option<PathBuf>,
    /// Layers skipped for being non-distributable
    pub skipped_non_distributable: Vec<SkippedLayer>,
}

/// Cancels an in-progress copy: in-flight operations complete, nothing
/// new starts, and the run returns `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Wires the copy components together for one or more runs.
pub struct Copier {
    registry: Arc<dyn Registry>,
    signatures: Arc<dyn SignatureFetcher>,
    opts: CopyOpts,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Copier {
    pub fn new(
        registry: Arc<dyn Registry>,
        signatures: Arc<dyn SignatureFetcher>,
        opts: CopyOpts,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Copier {
            registry,
            signatures,
            opts,
            cancel_tx,
            cancel_rx,
        }
    }

    /// Handle for cancelling runs started from this copier.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Copy the closure of `source` to `destination`.
    pub async fn run(
        &self,
        source: &CopySource,
        destination: &CopyDestination,
    ) -> Result<CopySummary> {
        self.validate(source, destination)?;

        let source_registry: Arc<dyn Registry> = match source {
            CopySource::Tar(path) => Arc::new(TarImageSource::open(path)?),
            _ => Arc::clone(&self.registry),
        };
        let cached = Arc::new(CachedSource::new(source_registry));

        let tag_generator: Arc<dyn TagGenerator> = if self.opts.use_repo_based_tags {
            Arc::new(RepoBasedTagGenerator)
        } else {
            Arc::new(DefaultTagGenerator)
        };

        let resolver = Resolver::new(
            Arc::clone(&cached),
            Arc::clone(&self.signatures),
            self.opts.concurrency,
            self.cancel_rx.clone(),
        );
        let refs = resolver.resolve(source).await?;

        match destination {
            CopyDestination::Tar(path) => {
                let write_opts = TarWriteOpts {
                    resume: self.opts.resume,
                    include_non_distributable: self.opts.include_non_distributable,
                    concurrency: self.opts.concurrency,
                };
                let summary =
                    tarset::write_image_set(&cached, &refs, path, &write_opts, &self.cancel_rx)
                        .await?;
                Ok(CopySummary {
                    image_count: summary.image_count,
                    destination: path.display().to_string(),
                    lock_output: None,
                    skipped_non_distributable: summary.skipped_non_distributable,
                })
            }
            CopyDestination::Repo(repo) => {
                let dest_repo = parse_destination_repo(repo)?;
                let engine = TransferEngine::new(
                    Arc::clone(&cached),
                    Arc::clone(&self.registry),
                    dest_repo,
                    Arc::clone(&tag_generator),
                    TransferOpts {
                        concurrency: self.opts.concurrency,
                        include_non_distributable: self.opts.include_non_distributable,
                    },
                    self.cancel_rx.clone(),
                );
                let (processed, skipped) = engine.copy_images(&refs).await?;

                if let Some(lock_path) = &self.opts.lock_output {
                    let input_lock = match source {
                        CopySource::Lockfile(path) => match Lock::from_path(path)? {
                            Lock::Images(lock) => Some(lock),
                            Lock::Bundle(_) => None,
                        },
                        _ => None,
                    };
                    let destination_view =
                        Arc::new(CachedSource::new(Arc::clone(&self.registry)));
                    lockoutput::write_lock_output(
                        lock_path,
                        &processed,
                        &destination_view,
                        input_lock.as_ref(),
                        tag_generator.as_ref(),
                    )
                    .await?;
                }

                Ok(CopySummary {
                    image_count: processed.len(),
                    destination: repo.clone(),
                    lock_output: self.opts.lock_output.clone(),
                    skipped_non_distributable: skipped,
                })
            }
        }
    }

    /// Reject invalid flag combinations before any I/O happens.
    fn validate(&self, source: &CopySource, destination: &CopyDestination) -> Result<()> {
        let tar_dst = matches!(destination, CopyDestination::Tar(_));
        if matches!(source, CopySource::Tar(_)) && tar_dst {
            return Err(RelayError::DestinationConflict(
                "cannot use a tar source with a tar destination".to_string(),
            ));
        }
        if self.opts.resume && !tar_dst {
            return Err(RelayError::ResumeRequiresTarDst);
        }
        if self.opts.lock_output.is_some() && tar_dst {
            return Err(RelayError::LockOutputRequiresRepoDst);
        }
        Ok(())
    }
}

/// Parse a `--to-repo` value. A destination repository names a place for
/// generated tags, so it must not pin a tag or digest itself.
fn parse_destination_repo(repo: &str) -> Result<ImageRef> {
    let parsed = ImageRef::parse(repo)?;
    if parsed.tag.is_some() || parsed.digest.is_some() {
        return Err(RelayError::DestinationConflict(format!(
            "destination repository '{}' must not include a tag or digest",
            repo
        )));
    }
    Ok(parsed)
}
