//! `imgrelay copy` command - copy an image or bundle closure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use imgrelay_core::error::RelayError;
use imgrelay_engine::{
    Copier, CopyDestination, CopyOpts, CopySource, CosignSignatureFetcher, NoopSignatureFetcher,
    RegistryAuth, RemoteRegistry, SignatureFetcher, DEFAULT_CONCURRENCY,
};

#[derive(Args)]
pub struct CopyArgs {
    /// Image reference to copy (e.g., "registry.io/org/app@sha256:...")
    #[arg(short, long)]
    pub image: Option<String>,

    /// Bundle reference to copy, including its image closure
    #[arg(short, long)]
    pub bundle: Option<String>,

    /// ImagesLock or BundleLock file to copy from
    #[arg(long)]
    pub lock: Option<PathBuf>,

    /// Tar archive to copy from
    #[arg(long)]
    pub tar: Option<PathBuf>,

    /// Destination repository (e.g., "registry.io/org/app")
    #[arg(long)]
    pub to_repo: Option<String>,

    /// Destination tar archive path
    #[arg(long)]
    pub to_tar: Option<PathBuf>,

    /// Write a lock file describing the copied artifacts
    #[arg(long)]
    pub lock_output: Option<PathBuf>,

    /// Maximum in-flight blob operations
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Include non-distributable layers when copying
    #[arg(long)]
    pub include_non_distributable_layers: bool,

    /// Derive destination tags from the source repository path
    #[arg(long)]
    pub repo_based_tags: bool,

    /// Skip blobs already present in the destination tar
    #[arg(long)]
    pub resume: bool,

    /// Copy cosign signatures alongside the images
    #[arg(long)]
    pub cosign_signatures: bool,
}

pub async fn execute(args: CopyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let source = select_source(&args)?;
    let destination = select_destination(&args)?;

    // Credentials from REGISTRY_USERNAME / REGISTRY_PASSWORD, anonymous
    // otherwise
    let registry = Arc::new(RemoteRegistry::with_auth(RegistryAuth::from_env()));

    let signatures: Arc<dyn SignatureFetcher> = if args.cosign_signatures {
        Arc::new(CosignSignatureFetcher::new(registry.clone()))
    } else {
        Arc::new(NoopSignatureFetcher)
    };

    let opts = CopyOpts {
        concurrency: args.concurrency,
        include_non_distributable: args.include_non_distributable_layers,
        use_repo_based_tags: args.repo_based_tags,
        resume: args.resume,
        lock_output: args.lock_output.clone(),
    };

    let copier = Copier::new(registry, signatures, opts);

    // Ctrl-C lets in-flight operations finish, then the run returns
    let cancel = copier.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling copy, letting in-flight uploads finish...");
            cancel.cancel();
        }
    });

    let summary = copier.run(&source, &destination).await?;

    println!("Copied {} images to {}", summary.image_count, summary.destination);
    if let Some(lock_path) = &summary.lock_output {
        println!("Lock output written to {}", lock_path.display());
    }

    if !summary.skipped_non_distributable.is_empty() {
        println!("Skipped the following non-distributable layers:");
        for layer in &summary.skipped_non_distributable {
            println!("  - {} layer {} ({})", layer.image, layer.digest, layer.media_type);
        }
        println!("Hint: use --include-non-distributable-layers to copy them");
    }

    Ok(())
}

/// Pick the copy source; exactly one of the source flags must be given.
fn select_source(args: &CopyArgs) -> Result<CopySource, RelayError> {
    let mut sources = Vec::new();
    if let Some(image) = &args.image {
        sources.push(CopySource::Image(image.clone()));
    }
    if let Some(bundle) = &args.bundle {
        sources.push(CopySource::Bundle(bundle.clone()));
    }
    if let Some(lock) = &args.lock {
        sources.push(CopySource::Lockfile(lock.clone()));
    }
    if let Some(tar) = &args.tar {
        sources.push(CopySource::Tar(tar.clone()));
    }

    if sources.len() != 1 {
        return Err(RelayError::SourceConflict(
            "expected exactly one of --image, --bundle, --lock, or --tar".to_string(),
        ));
    }
    Ok(sources.remove(0))
}

/// Pick the copy destination; exactly one of the destination flags must
/// be given.
fn select_destination(args: &CopyArgs) -> Result<CopyDestination, RelayError> {
    match (&args.to_repo, &args.to_tar) {
        (Some(repo), None) => Ok(CopyDestination::Repo(repo.clone())),
        (None, Some(tar)) => Ok(CopyDestination::Tar(tar.clone())),
        _ => Err(RelayError::DestinationConflict(
            "expected exactly one of --to-repo or --to-tar".to_string(),
        )),
    }
}
