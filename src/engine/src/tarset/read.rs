//! Reading an image set archive back as a registry-like source.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use imgrelay_core::error::{RelayError, Result};

use crate::imageset::UnprocessedImageRef;
use crate::refs::ImageRef;
use crate::registry::{sniff_media_type, RawManifest, Registry};

use super::{digest_from_blob_path, TarIndex, TAR_INDEX_NAME};

/// Read-only [`Registry`] view over an image set archive.
///
/// Blob offsets are indexed once at open time; reads seek directly into
/// the archive. Write operations fail: a tar is never a copy
/// destination through this interface, and mounts are never offered.
#[derive(Debug)]
pub struct TarImageSource {
    path: PathBuf,
    index: TarIndex,
    // digest -> (data offset, size)
    offsets: HashMap<String, (u64, u64)>,
}

impl TarImageSource {
    /// Open an archive and index its contents.
    ///
    /// Fails when the archive has no `manifest.json`: that marks an
    /// interrupted write that was never resumed to completion.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut archive = tar::Archive::new(file);

        let mut offsets = HashMap::new();
        let mut index_bytes: Option<Vec<u8>> = None;

        for entry in archive
            .entries()
            .map_err(|e| RelayError::Tar(format!("failed to read archive: {}", e)))?
        {
            let mut entry = entry.map_err(|e| RelayError::Tar(e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| RelayError::Tar(e.to_string()))?
                .to_string_lossy()
                .to_string();

            if let Some(digest) = digest_from_blob_path(&name) {
                offsets.insert(digest, (entry.raw_file_position(), entry.size()));
            } else if name == TAR_INDEX_NAME {
                // A resumed archive holds an index per attempt; the last
                // one describes the complete set
                let mut bytes = Vec::new();
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| RelayError::Tar(e.to_string()))?;
                index_bytes = Some(bytes);
            }
        }

        let index_bytes = index_bytes.ok_or_else(|| {
            RelayError::Tar(format!(
                "archive '{}' has no {}; it was not written to completion and must be regenerated",
                path.display(),
                TAR_INDEX_NAME
            ))
        })?;
        let index: TarIndex = serde_json::from_slice(&index_bytes)?;

        Ok(TarImageSource {
            path: path.to_path_buf(),
            index,
            offsets,
        })
    }

    /// The images recorded in the archive, as copy-set entries with their
    /// stored labels.
    pub fn entries(&self) -> Result<Vec<UnprocessedImageRef>> {
        self.index
            .images
            .iter()
            .map(|image| {
                let entry = UnprocessedImageRef {
                    digest_ref: image.image.clone(),
                    tag: image.tag.clone(),
                    labels: image.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    orig_ref: None,
                };
                entry.validate()?;
                Ok(entry)
            })
            .collect()
    }

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let (offset, size) = self.offsets.get(digest).ok_or_else(|| {
            RelayError::Tar(format!(
                "blob {} not found in archive '{}'",
                digest,
                self.path.display()
            ))
        })?;

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(*offset))?;
        let mut data = vec![0u8; *size as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    fn find_by_tag(&self, reference: &ImageRef) -> Result<&super::TarImageEntry> {
        let wanted_tag = reference.tag.as_deref().unwrap_or_default();
        self.index
            .images
            .iter()
            .find(|image| {
                if image.tag != wanted_tag {
                    return false;
                }
                ImageRef::parse(&image.image)
                    .map(|r| {
                        r.registry == reference.registry && r.repository == reference.repository
                    })
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                RelayError::Tar(format!(
                    "no image tagged '{}' for '{}/{}' in archive '{}'",
                    wanted_tag,
                    reference.registry,
                    reference.repository,
                    self.path.display()
                ))
            })
    }

    fn read_only_err(&self) -> RelayError {
        RelayError::InternalInconsistency(format!(
            "archive '{}' is a read-only source",
            self.path.display()
        ))
    }
}

#[async_trait]
impl Registry for TarImageSource {
    async fn get_manifest(&self, reference: &ImageRef) -> Result<RawManifest> {
        let digest = match reference.digest.as_deref() {
            Some(digest) => digest.to_string(),
            None => self.find_by_tag(reference)?.digest.clone(),
        };

        let bytes = self.read_blob(&digest)?;
        let media_type = sniff_media_type(&bytes);
        Ok(RawManifest {
            bytes,
            digest,
            media_type,
        })
    }

    async fn put_manifest(&self, _reference: &ImageRef, _manifest: &RawManifest) -> Result<()> {
        Err(self.read_only_err())
    }

    async fn get_blob(&self, _reference: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        self.read_blob(digest)
    }

    async fn has_blob(&self, _reference: &ImageRef, digest: &str) -> Result<bool> {
        Ok(self.offsets.contains_key(digest))
    }

    async fn put_blob(&self, _reference: &ImageRef, _digest: &str, _data: Vec<u8>) -> Result<()> {
        Err(self.read_only_err())
    }

    async fn mount_blob(
        &self,
        _reference: &ImageRef,
        _from_repository: &str,
        _digest: &str,
    ) -> Result<bool> {
        Ok(false)
    }
}
