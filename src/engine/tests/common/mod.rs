//! Shared fixtures: an in-memory registry and OCI content builders.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use imgrelay_core::error::{RelayError, Result};
use imgrelay_engine::bundle::{BUNDLE_LABEL, BUNDLE_LOCKFILE_PATH};
use imgrelay_engine::registry::{
    sha256_digest, sniff_media_type, RawManifest, Registry, OCI_INDEX_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE,
};
use imgrelay_engine::ImageRef;

/// In-memory registry serving any number of hosts and repositories.
#[derive(Default)]
pub struct InMemoryRegistry {
    // (registry/repo, digest) -> blob
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    // (registry/repo, digest) -> manifest
    manifests_by_digest: Mutex<HashMap<(String, String), RawManifest>>,
    // (registry/repo, tag) -> manifest
    manifests_by_tag: Mutex<HashMap<(String, String), RawManifest>>,
    // digests whose blob fetch fails, for interruption tests
    failing_blobs: Mutex<HashSet<String>>,
    pub blob_uploads: AtomicUsize,
    pub blob_mounts: AtomicUsize,
    blob_fetch_log: Mutex<Vec<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_key(reference: &ImageRef) -> String {
        format!("{}/{}", reference.registry, reference.repository)
    }

    /// Make fetching the given blob fail until cleared.
    pub fn fail_blob(&self, digest: &str) {
        self.failing_blobs.lock().unwrap().insert(digest.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_blobs.lock().unwrap().clear();
    }

    /// Digests fetched through `get_blob`, in call order.
    pub fn fetched_blobs(&self) -> Vec<String> {
        self.blob_fetch_log.lock().unwrap().clone()
    }

    pub fn reset_counters(&self) {
        self.blob_uploads.store(0, Ordering::SeqCst);
        self.blob_mounts.store(0, Ordering::SeqCst);
        self.blob_fetch_log.lock().unwrap().clear();
    }

    /// Whether a repository holds the blob, for assertions.
    pub fn blob_present(&self, repo: &str, digest: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains_key(&(repo.to_string(), digest.to_string()))
    }

    pub fn blob_bytes(&self, repo: &str, digest: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(repo.to_string(), digest.to_string()))
            .cloned()
    }

    pub fn manifest_at_tag(&self, repo: &str, tag: &str) -> Option<RawManifest> {
        self.manifests_by_tag
            .lock()
            .unwrap()
            .get(&(repo.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn manifest_at_digest(&self, repo: &str, digest: &str) -> Option<RawManifest> {
        self.manifests_by_digest
            .lock()
            .unwrap()
            .get(&(repo.to_string(), digest.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get_manifest(&self, reference: &ImageRef) -> Result<RawManifest> {
        let repo = Self::repo_key(reference);
        let found = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => self
                .manifests_by_digest
                .lock()
                .unwrap()
                .get(&(repo.clone(), digest.clone()))
                .cloned(),
            (None, Some(tag)) => self
                .manifests_by_tag
                .lock()
                .unwrap()
                .get(&(repo.clone(), tag.clone()))
                .cloned(),
            (None, None) => None,
        };
        found.ok_or_else(|| RelayError::Network {
            registry: reference.registry.clone(),
            message: format!("manifest not found: {}", reference),
        })
    }

    async fn put_manifest(&self, reference: &ImageRef, manifest: &RawManifest) -> Result<()> {
        let repo = Self::repo_key(reference);
        self.manifests_by_digest
            .lock()
            .unwrap()
            .insert((repo.clone(), manifest.digest.clone()), manifest.clone());
        if let Some(tag) = &reference.tag {
            self.manifests_by_tag
                .lock()
                .unwrap()
                .insert((repo, tag.clone()), manifest.clone());
        }
        Ok(())
    }

    async fn get_blob(&self, reference: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        if self.failing_blobs.lock().unwrap().contains(digest) {
            return Err(RelayError::Network {
                registry: reference.registry.clone(),
                message: format!("injected failure for {}", digest),
            });
        }
        self.blob_fetch_log.lock().unwrap().push(digest.to_string());

        let repo = Self::repo_key(reference);
        self.blobs
            .lock()
            .unwrap()
            .get(&(repo, digest.to_string()))
            .cloned()
            .ok_or_else(|| RelayError::Network {
                registry: reference.registry.clone(),
                message: format!("blob not found: {}", digest),
            })
    }

    async fn has_blob(&self, reference: &ImageRef, digest: &str) -> Result<bool> {
        let repo = Self::repo_key(reference);
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .contains_key(&(repo, digest.to_string())))
    }

    async fn put_blob(&self, reference: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()> {
        self.blob_uploads.fetch_add(1, Ordering::SeqCst);
        let repo = Self::repo_key(reference);
        self.blobs
            .lock()
            .unwrap()
            .insert((repo, digest.to_string()), data);
        Ok(())
    }

    async fn mount_blob(
        &self,
        reference: &ImageRef,
        from_repository: &str,
        digest: &str,
    ) -> Result<bool> {
        let from = format!("{}/{}", reference.registry, from_repository);
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&(from, digest.to_string()))
            .cloned();
        match data {
            Some(data) => {
                self.blob_mounts.fetch_add(1, Ordering::SeqCst);
                let repo = Self::repo_key(reference);
                self.blobs
                    .lock()
                    .unwrap()
                    .insert((repo, digest.to_string()), data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn supports_mount(&self) -> bool {
        true
    }
}

/// A layer to include when building a test image.
pub struct TestLayer {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl TestLayer {
    pub fn plain(bytes: &[u8]) -> Self {
        TestLayer {
            bytes: bytes.to_vec(),
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
        }
    }

    pub fn non_distributable(bytes: &[u8]) -> Self {
        TestLayer {
            bytes: bytes.to_vec(),
            media_type: "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip".to_string(),
        }
    }
}

/// Push a single-architecture image; returns its digested reference.
pub async fn push_image(
    registry: &InMemoryRegistry,
    reference: &str,
    layers: &[TestLayer],
    labels: &[(&str, &str)],
) -> String {
    let parsed = ImageRef::parse(reference).unwrap();

    let label_map: HashMap<&str, &str> = labels.iter().cloned().collect();
    let diff_ids: Vec<String> = layers.iter().map(|l| sha256_digest(&l.bytes)).collect();
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Labels": label_map},
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
    });
    let config_bytes = serde_json::to_vec(&config).unwrap();
    let config_digest = sha256_digest(&config_bytes);

    let mut layer_descriptors = Vec::new();
    for layer in layers {
        let digest = sha256_digest(&layer.bytes);
        registry
            .put_blob(&parsed, &digest, layer.bytes.clone())
            .await
            .unwrap();
        layer_descriptors.push(serde_json::json!({
            "mediaType": layer.media_type,
            "digest": digest,
            "size": layer.bytes.len(),
        }));
    }
    registry
        .put_blob(&parsed, &config_digest, config_bytes.clone())
        .await
        .unwrap();

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_bytes.len(),
        },
        "layers": layer_descriptors,
    });
    let raw = RawManifest::from_bytes(
        serde_json::to_vec(&manifest).unwrap(),
        OCI_MANIFEST_MEDIA_TYPE,
    );
    registry.put_manifest(&parsed, &raw).await.unwrap();
    registry.reset_counters();

    format!(
        "{}/{}@{}",
        parsed.registry, parsed.repository, raw.digest
    )
}

/// Push a bundle whose embedded lockfile lists the given digested
/// references; returns the bundle's digested reference.
pub async fn push_bundle(
    registry: &InMemoryRegistry,
    reference: &str,
    image_refs: &[&str],
) -> String {
    let images: String = image_refs
        .iter()
        .map(|r| format!("- image: {}\n", r))
        .collect();
    let lockfile = format!(
        "apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages:\n{}",
        images
    );

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(lockfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, BUNDLE_LOCKFILE_PATH, lockfile.as_bytes())
        .unwrap();
    let layer = builder.into_inner().unwrap();

    push_image(
        registry,
        reference,
        &[TestLayer::plain(&layer)],
        &[(BUNDLE_LABEL, "true")],
    )
    .await
}

/// Push a two-child image index; returns its digested reference.
pub async fn push_index(
    registry: &InMemoryRegistry,
    reference: &str,
    child_refs: &[&str],
) -> String {
    let parsed = ImageRef::parse(reference).unwrap();

    let mut child_descriptors = Vec::new();
    for child in child_refs {
        let child_parsed = ImageRef::parse(child).unwrap();
        let raw = registry.get_manifest(&child_parsed).await.unwrap();
        child_descriptors.push(serde_json::json!({
            "mediaType": raw.media_type,
            "digest": raw.digest,
            "size": raw.bytes.len(),
        }));
    }

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX_MEDIA_TYPE,
        "manifests": child_descriptors,
    });
    let raw = RawManifest::from_bytes(
        serde_json::to_vec(&index).unwrap(),
        OCI_INDEX_MEDIA_TYPE,
    );
    registry.put_manifest(&parsed, &raw).await.unwrap();
    registry.reset_counters();

    format!(
        "{}/{}@{}",
        parsed.registry, parsed.repository, raw.digest
    )
}

/// Read the embedded lockfile image entries out of a bundle stored at
/// the given repository and digest.
pub fn read_bundle_lockfile_entries(
    registry: &InMemoryRegistry,
    repo: &str,
    manifest_digest: &str,
) -> Vec<String> {
    use std::io::Read;

    let raw = registry
        .manifest_at_digest(repo, manifest_digest)
        .expect("bundle manifest at destination");
    assert_eq!(sniff_media_type(&raw.bytes), OCI_MANIFEST_MEDIA_TYPE);

    let manifest: serde_json::Value = serde_json::from_slice(&raw.bytes).unwrap();
    let layers = manifest["layers"].as_array().unwrap();

    for layer in layers {
        let digest = layer["digest"].as_str().unwrap();
        let Some(bytes) = registry.blob_bytes(repo, digest) else {
            continue;
        };
        let mut archive = tar::Archive::new(&bytes[..]);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            if path.trim_start_matches("./") != BUNDLE_LOCKFILE_PATH {
                continue;
            }
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            let lock: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();
            return lock["images"]
                .as_sequence()
                .unwrap()
                .iter()
                .map(|i| i["image"].as_str().unwrap().to_string())
                .collect();
        }
    }
    panic!("no embedded lockfile found in bundle {}", manifest_digest);
}
