//! Registry capability set.
//!
//! The copy engine talks to sources and destinations through the
//! [`Registry`] trait: get/put/head blob, get/put manifest, cross-repo
//! mount. A remote registry ([`RemoteRegistry`]), a tar archive
//! ([`crate::tarset::TarImageSource`]) and test fakes all satisfy it.
//!
//! Manifests travel as raw bytes ([`RawManifest`]): pushing the exact
//! bytes that were pulled is what keeps digests stable across a copy.

mod remote;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use imgrelay_core::error::{RelayError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};

use crate::refs::ImageRef;

pub use remote::{RegistryAuth, RemoteRegistry};

/// OCI image manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index media type.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema2 manifest media type.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema2 manifest list media type.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Compute the `sha256:<hex>` digest of raw bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// A manifest in wire form: the exact bytes a registry served, their
/// digest, and the media type they were served under.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub digest: String,
    pub media_type: String,
}

/// A [`RawManifest`] parsed into its OCI shape.
#[derive(Debug, Clone)]
pub enum ParsedManifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl RawManifest {
    /// Build from bytes, computing the digest.
    pub fn from_bytes(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        let digest = sha256_digest(&bytes);
        RawManifest {
            bytes,
            digest,
            media_type: media_type.into(),
        }
    }

    /// Whether this manifest is an image index (multi-architecture).
    pub fn is_index(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            OCI_INDEX_MEDIA_TYPE | DOCKER_MANIFEST_LIST_MEDIA_TYPE
        )
    }

    /// Parse into an [`ImageManifest`] or [`ImageIndex`] according to the
    /// media type.
    pub fn parse(&self) -> Result<ParsedManifest> {
        if self.is_index() {
            let index: ImageIndex = serde_json::from_slice(&self.bytes)?;
            Ok(ParsedManifest::Index(index))
        } else {
            let manifest: ImageManifest = serde_json::from_slice(&self.bytes)?;
            Ok(ParsedManifest::Image(manifest))
        }
    }

    /// Parse, requiring a single-architecture image manifest.
    pub fn parse_image(&self) -> Result<ImageManifest> {
        match self.parse()? {
            ParsedManifest::Image(manifest) => Ok(manifest),
            ParsedManifest::Index(_) => Err(RelayError::InternalInconsistency(format!(
                "expected image manifest at {}, found index",
                self.digest
            ))),
        }
    }
}

/// Sniff a manifest media type from its JSON body.
///
/// Used when the transport does not hand back a content type. Falls back
/// to the OCI manifest type.
pub fn sniff_media_type(bytes: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
        if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
            return media_type.to_string();
        }
        if value.get("manifests").is_some() {
            return OCI_INDEX_MEDIA_TYPE.to_string();
        }
    }
    OCI_MANIFEST_MEDIA_TYPE.to_string()
}

/// Capability set the copy engine requires from a content source or
/// destination.
///
/// All operations address the repository of the given reference; blob
/// operations take the digest separately so one reference can serve a
/// whole image's blobs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the manifest the reference points at (tag or digest).
    async fn get_manifest(&self, reference: &ImageRef) -> Result<RawManifest>;

    /// Push raw manifest bytes at the reference (tag or digest).
    async fn put_manifest(&self, reference: &ImageRef, manifest: &RawManifest) -> Result<()>;

    /// Fetch a blob by digest.
    async fn get_blob(&self, reference: &ImageRef, digest: &str) -> Result<Vec<u8>>;

    /// Whether the repository already holds the blob.
    async fn has_blob(&self, reference: &ImageRef, digest: &str) -> Result<bool>;

    /// Upload a blob.
    async fn put_blob(&self, reference: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()>;

    /// Attempt to mount a blob from another repository on the same host.
    /// `Ok(false)` means the mount was refused; callers fall back to a
    /// streamed upload.
    async fn mount_blob(
        &self,
        reference: &ImageRef,
        from_repository: &str,
        digest: &str,
    ) -> Result<bool>;

    /// Whether cross-repository mounts can ever succeed against this
    /// source. Tar-backed sources return false.
    fn supports_mount(&self) -> bool {
        false
    }
}

/// Read-side wrapper that caches manifests per digest for the lifetime of
/// a copy run.
pub struct CachedSource {
    inner: Arc<dyn Registry>,
    manifests: Mutex<HashMap<String, Arc<RawManifest>>>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        CachedSource {
            inner,
            manifests: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped source.
    pub fn inner(&self) -> &Arc<dyn Registry> {
        &self.inner
    }

    /// Fetch a manifest, serving repeat lookups for the same digest from
    /// memory.
    pub async fn get_manifest(&self, reference: &ImageRef) -> Result<Arc<RawManifest>> {
        if let Some(digest) = reference.digest.as_deref() {
            if let Some(cached) = self.manifests.lock().unwrap().get(digest) {
                return Ok(Arc::clone(cached));
            }
        }

        let manifest = Arc::new(self.inner.get_manifest(reference).await?);
        self.manifests
            .lock()
            .unwrap()
            .insert(manifest.digest.clone(), Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Fetch a blob from the wrapped source.
    pub async fn get_blob(&self, reference: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        self.inner.get_blob(reference, digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_raw_manifest_from_bytes() {
        let raw = RawManifest::from_bytes(b"{}".to_vec(), OCI_MANIFEST_MEDIA_TYPE);
        assert!(raw.digest.starts_with("sha256:"));
        assert_eq!(raw.digest.len(), 7 + 64);
        assert!(!raw.is_index());
    }

    #[test]
    fn test_is_index_by_media_type() {
        let raw = RawManifest::from_bytes(b"{}".to_vec(), OCI_INDEX_MEDIA_TYPE);
        assert!(raw.is_index());
        let raw = RawManifest::from_bytes(b"{}".to_vec(), DOCKER_MANIFEST_LIST_MEDIA_TYPE);
        assert!(raw.is_index());
    }

    #[test]
    fn test_sniff_media_type() {
        let manifest = format!(r#"{{"mediaType": "{DOCKER_MANIFEST_MEDIA_TYPE}"}}"#);
        assert_eq!(sniff_media_type(manifest.as_bytes()), DOCKER_MANIFEST_MEDIA_TYPE);

        let index = r#"{"schemaVersion": 2, "manifests": []}"#;
        assert_eq!(sniff_media_type(index.as_bytes()), OCI_INDEX_MEDIA_TYPE);

        assert_eq!(sniff_media_type(b"{}"), OCI_MANIFEST_MEDIA_TYPE);
    }

    #[test]
    fn test_parse_image_rejects_index() {
        let index_json = r#"{"schemaVersion": 2, "manifests": []}"#;
        let raw = RawManifest::from_bytes(index_json.into(), OCI_INDEX_MEDIA_TYPE);
        assert!(raw.parse_image().is_err());
        assert!(matches!(raw.parse().unwrap(), ParsedManifest::Index(_)));
    }
}
