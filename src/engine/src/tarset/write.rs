//! Serializing an image set into a tar archive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use imgrelay_core::error::{RelayError, Result};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::imageset::{UnprocessedImageRef, UnprocessedImageRefs};
use crate::refs::ImageRef;
use crate::registry::{CachedSource, ParsedManifest};
use crate::transfer::{is_non_distributable, SkippedLayer};

use super::{blob_path, digest_from_blob_path, TarBlobRef, TarImageEntry, TarIndex, TAR_INDEX_NAME};

/// Tar write tuning knobs.
#[derive(Debug, Clone)]
pub struct TarWriteOpts {
    /// Skip blobs already present in an existing archive
    pub resume: bool,
    /// Copy non-distributable layers instead of skipping them
    pub include_non_distributable: bool,
    /// Maximum in-flight blob fetches
    pub concurrency: usize,
}

/// Outcome of a tar write.
#[derive(Debug)]
pub struct TarWriteSummary {
    pub image_count: usize,
    pub blobs_written: usize,
    pub skipped_non_distributable: Vec<SkippedLayer>,
}

/// How a planned blob's bytes are obtained.
enum BlobFetch {
    /// Bytes already in hand (manifests)
    Inline(Vec<u8>),
    /// Fetch by digest from the repository of this reference
    Remote(ImageRef),
}

/// Serialize the image set into a tar archive at `path`.
///
/// Blobs stream into the archive as they are fetched, first write wins
/// per digest, and the index is finalized last. With `resume`, blobs
/// already present in the target archive are not fetched again.
pub async fn write_image_set(
    source: &Arc<CachedSource>,
    refs: &UnprocessedImageRefs,
    path: &Path,
    opts: &TarWriteOpts,
    cancel: &watch::Receiver<bool>,
) -> Result<TarWriteSummary> {
    let mut entries = Vec::new();
    let mut blobs: HashMap<String, BlobFetch> = HashMap::new();
    let mut skipped = Vec::new();

    for entry in refs.all() {
        check_cancelled(cancel)?;
        let planned = plan_image(source, &entry, opts, &mut blobs, &mut skipped).await?;
        entries.push(planned);
    }

    let (mut builder, existing) = open_archive(path, opts.resume)?;

    // Inline blobs first, then fetched blobs as they complete
    let mut remote = Vec::new();
    let mut written = 0usize;
    for (digest, fetch) in blobs {
        if existing.contains(&digest) {
            continue;
        }
        match fetch {
            BlobFetch::Inline(bytes) => {
                append_blob(&mut builder, &digest, &bytes)?;
                written += 1;
            }
            BlobFetch::Remote(reference) => remote.push((digest, reference)),
        }
    }

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (digest, reference) in remote {
        let source = Arc::clone(source);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.map_err(|_| {
                RelayError::InternalInconsistency("tar fetch semaphore closed".to_string())
            })?;
            check_cancelled(&cancel)?;
            let data = source.get_blob(&reference, &digest).await?;
            Ok::<_, RelayError>((digest, data))
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| {
            RelayError::InternalInconsistency(format!("tar fetch task panicked: {}", e))
        });
        match outcome {
            Ok(Ok((digest, data))) => {
                if first_err.is_none() {
                    append_blob(&mut builder, &digest, &data)?;
                    written += 1;
                }
            }
            Ok(Err(e)) | Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let index = TarIndex { images: entries };
    let index_bytes = serde_json::to_vec(&index)?;
    append_entry(&mut builder, TAR_INDEX_NAME, &index_bytes)?;

    let mut file = builder
        .into_inner()
        .map_err(|e| RelayError::Tar(format!("failed to finalize archive: {}", e)))?;
    file.flush()?;
    file.sync_all()?;

    tracing::info!(
        path = %path.display(),
        images = index.images.len(),
        blobs = written,
        "Wrote image set archive"
    );

    Ok(TarWriteSummary {
        image_count: index.images.len(),
        blobs_written: written,
        skipped_non_distributable: skipped,
    })
}

/// Plan one set entry: record every blob it needs and build its index
/// entry. Image indices are walked down to their child manifests so the
/// archive is self-contained.
async fn plan_image(
    source: &Arc<CachedSource>,
    entry: &UnprocessedImageRef,
    opts: &TarWriteOpts,
    blobs: &mut HashMap<String, BlobFetch>,
    skipped: &mut Vec<SkippedLayer>,
) -> Result<TarImageEntry> {
    let src_ref = ImageRef::parse_digested(&entry.digest_ref)?;
    let raw = source.get_manifest(&src_ref).await?;
    blobs
        .entry(raw.digest.clone())
        .or_insert_with(|| BlobFetch::Inline(raw.bytes.clone()));

    let mut config_path = String::new();
    let mut layer_refs = Vec::new();

    // Walk the manifest tree; an index pushes its children onto the stack
    let mut stack = vec![(src_ref.clone(), Arc::clone(&raw), true)];
    while let Some((item_ref, item, is_top)) = stack.pop() {
        match item.parse()? {
            ParsedManifest::Image(manifest) => {
                let config_digest = manifest.config().digest().to_string();
                blobs
                    .entry(config_digest.clone())
                    .or_insert_with(|| BlobFetch::Remote(item_ref.clone()));
                if is_top {
                    config_path = blob_path(&config_digest);
                } else {
                    layer_refs.push(TarBlobRef {
                        digest: config_digest.clone(),
                        path: blob_path(&config_digest),
                    });
                }

                for layer in manifest.layers() {
                    let digest = layer.digest().to_string();
                    let media_type = layer.media_type().to_string();
                    if is_non_distributable(&media_type) && !opts.include_non_distributable {
                        tracing::warn!(
                            image = %entry.digest_ref,
                            digest = %digest,
                            media_type = %media_type,
                            "Skipped non-distributable layer"
                        );
                        skipped.push(SkippedLayer {
                            image: entry.digest_ref.clone(),
                            digest,
                            media_type,
                        });
                        continue;
                    }
                    blobs
                        .entry(digest.clone())
                        .or_insert_with(|| BlobFetch::Remote(item_ref.clone()));
                    layer_refs.push(TarBlobRef {
                        digest: digest.clone(),
                        path: blob_path(&digest),
                    });
                }
            }
            ParsedManifest::Index(index) => {
                for descriptor in index.manifests() {
                    let child_ref = item_ref.with_digest(descriptor.digest().as_ref());
                    let child = source.get_manifest(&child_ref).await?;
                    blobs
                        .entry(child.digest.clone())
                        .or_insert_with(|| BlobFetch::Inline(child.bytes.clone()));
                    layer_refs.push(TarBlobRef {
                        digest: child.digest.clone(),
                        path: blob_path(&child.digest),
                    });
                    stack.push((child_ref, child, false));
                }
            }
        }
    }

    Ok(TarImageEntry {
        image: entry.digest_ref.clone(),
        digest: raw.digest.clone(),
        tag: entry.tag.clone(),
        labels: entry.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<BTreeMap<_, _>>(),
        manifest_path: blob_path(&raw.digest),
        config_path,
        layers: layer_refs,
    })
}

/// Open the target archive for writing.
///
/// With `resume` against an existing non-empty file, scan it for blobs
/// already present (the index, when one survived, also contributes) and
/// position the writer over the archive's trailing zero blocks.
fn open_archive(
    path: &Path,
    resume: bool,
) -> Result<(tar::Builder<std::fs::File>, HashSet<String>)> {
    let existing_len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if !resume || existing_len == 0 {
        let file = std::fs::File::create(path)?;
        return Ok((tar::Builder::new(file), HashSet::new()));
    }

    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut digests = HashSet::new();
    let mut index_bytes = None;
    let mut end = 0u64;

    {
        let mut archive = tar::Archive::new(&file);
        for entry in archive
            .entries()
            .map_err(|e| RelayError::Tar(format!("failed to scan existing archive: {}", e)))?
        {
            // A crash can leave a truncated trailing entry; everything up
            // to it is reusable
            let Ok(mut entry) = entry else { break };
            let size = entry.size();
            let data_start = entry.raw_file_position();
            if data_start + size > existing_len {
                break;
            }

            let padded = size.div_ceil(512) * 512;
            end = end.max(data_start + padded);

            let name = entry
                .path()
                .map_err(|e| RelayError::Tar(e.to_string()))?
                .to_string_lossy()
                .to_string();
            if let Some(digest) = digest_from_blob_path(&name) {
                digests.insert(digest);
            } else if name == TAR_INDEX_NAME {
                let mut bytes = Vec::new();
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| RelayError::Tar(e.to_string()))?;
                index_bytes = Some(bytes);
            }
        }
    }

    if let Some(bytes) = index_bytes {
        if let Ok(index) = serde_json::from_slice::<TarIndex>(&bytes) {
            for image in index.images {
                digests.insert(image.digest);
                for layer in image.layers {
                    digests.insert(layer.digest);
                }
            }
        }
    }

    tracing::info!(
        path = %path.display(),
        existing_blobs = digests.len(),
        "Resuming archive"
    );

    file.set_len(end)?;
    file.seek(SeekFrom::Start(end))?;
    Ok((tar::Builder::new(file), digests))
}

fn append_blob(builder: &mut tar::Builder<std::fs::File>, digest: &str, data: &[u8]) -> Result<()> {
    append_entry(builder, &blob_path(digest), data)
}

fn append_entry(builder: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| RelayError::Tar(format!("failed to append '{}': {}", name, e)))?;
    Ok(())
}

fn check_cancelled(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        return Err(RelayError::Cancelled);
    }
    Ok(())
}
