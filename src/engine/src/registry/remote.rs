//! Remote registry access through the `oci-distribution` client.

use async_trait::async_trait;
use imgrelay_core::error::{RelayError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use crate::refs::ImageRef;

use super::{sniff_media_type, RawManifest, Registry};

/// Manifest media types requested on pull.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    super::OCI_MANIFEST_MEDIA_TYPE,
    super::OCI_INDEX_MEDIA_TYPE,
    super::DOCKER_MANIFEST_MEDIA_TYPE,
    super::DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`Registry`] implementation backed by the `oci-distribution` client.
///
/// The client owns transport concerns: token auth, TLS, retries of
/// transient failures, and read timeouts.
pub struct RemoteRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl RemoteRegistry {
    /// Create a registry client with anonymous authentication.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    /// Create a registry client with the given authentication.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    fn network_err(reference: &ImageRef, err: impl std::fmt::Display) -> RelayError {
        RelayError::Network {
            registry: reference.registry.clone(),
            message: err.to_string(),
        }
    }

    /// Convert an ImageRef into an oci-distribution Reference.
    fn to_oci_reference(&self, reference: &ImageRef) -> Result<Reference> {
        reference
            .full_reference()
            .parse::<Reference>()
            .map_err(|e| RelayError::Reference {
                reference: reference.full_reference(),
                reason: e.to_string(),
            })
    }

    /// Reference addressing a blob digest in the repository of `reference`.
    fn blob_reference(&self, reference: &ImageRef, digest: &str) -> Result<Reference> {
        self.to_oci_reference(&reference.with_digest(digest))
    }

    async fn authenticate(&self, oci_ref: &Reference, op: RegistryOperation) -> Result<()> {
        self.client
            .auth(oci_ref, &self.auth.to_oci_auth(), op)
            .await
            .map_err(|e| RelayError::Network {
                registry: oci_ref.registry().to_string(),
                message: format!("authentication failed: {}", e),
            })?;
        Ok(())
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for RemoteRegistry {
    async fn get_manifest(&self, reference: &ImageRef) -> Result<RawManifest> {
        let oci_ref = self.to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| Self::network_err(reference, e))?;

        let media_type = sniff_media_type(&bytes);
        Ok(RawManifest {
            bytes,
            digest,
            media_type,
        })
    }

    async fn put_manifest(&self, reference: &ImageRef, manifest: &RawManifest) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authenticate(&oci_ref, RegistryOperation::Push).await?;

        let content_type = manifest
            .media_type
            .parse()
            .map_err(|e| Self::network_err(reference, e))?;

        self.client
            .push_manifest_raw(&oci_ref, manifest.bytes.clone(), content_type)
            .await
            .map_err(|e| Self::network_err(reference, e))?;

        tracing::debug!(
            reference = %reference,
            digest = %manifest.digest,
            "Pushed manifest"
        );
        Ok(())
    }

    async fn get_blob(&self, reference: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let oci_ref = self.blob_reference(reference, digest)?;
        self.authenticate(&oci_ref, RegistryOperation::Pull).await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };

        let mut data = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| Self::network_err(reference, e))?;
        Ok(data)
    }

    async fn has_blob(&self, reference: &ImageRef, digest: &str) -> Result<bool> {
        let oci_ref = self.blob_reference(reference, digest)?;
        self.authenticate(&oci_ref, RegistryOperation::Pull).await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };

        // The transport exposes no blob HEAD; probe with a pull and treat
        // failure as absence. A false negative only costs a re-upload.
        let mut data = Vec::new();
        match self.client.pull_blob(&oci_ref, &descriptor, &mut data).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!(
                    digest = %digest,
                    repository = %reference.repository,
                    error = %e,
                    "Blob existence probe failed, assuming absent"
                );
                Ok(false)
            }
        }
    }

    async fn put_blob(&self, reference: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authenticate(&oci_ref, RegistryOperation::Push).await?;

        self.client
            .push_blob(&oci_ref, &data, digest)
            .await
            .map_err(|e| Self::network_err(reference, e))?;

        tracing::debug!(
            digest = %digest,
            size = data.len(),
            repository = %reference.repository,
            "Uploaded blob"
        );
        Ok(())
    }

    async fn mount_blob(
        &self,
        reference: &ImageRef,
        from_repository: &str,
        digest: &str,
    ) -> Result<bool> {
        let oci_ref = self.to_oci_reference(reference)?;
        let source = ImageRef {
            registry: reference.registry.clone(),
            repository: from_repository.to_string(),
            tag: None,
            digest: Some(digest.to_string()),
        };
        let source_ref = self.to_oci_reference(&source)?;

        self.authenticate(&oci_ref, RegistryOperation::Push).await?;

        match self.client.mount_blob(&oci_ref, &source_ref, digest).await {
            Ok(_) => {
                tracing::debug!(
                    digest = %digest,
                    from = %from_repository,
                    to = %reference.repository,
                    "Mounted blob"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(
                    digest = %digest,
                    from = %from_repository,
                    error = %e,
                    "Blob mount refused, falling back to upload"
                );
                Ok(false)
            }
        }
    }

    fn supports_mount(&self) -> bool {
        true
    }
}
