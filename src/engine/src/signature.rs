//! Signature artifact discovery.
//!
//! Cosign stores a signature for `repo@sha256:<hex>` as an ordinary image
//! tagged `sha256-<hex>.sig` in the same repository. The fetcher contract
//! is deliberately small so signature support can be switched off with a
//! no-op implementation.

use std::sync::Arc;

use async_trait::async_trait;
use imgrelay_core::error::Result;

use crate::imageset::UnprocessedImageRef;
use crate::refs::ImageRef;
use crate::registry::Registry;

/// Looks up signature artifacts associated with a digested image.
#[async_trait]
pub trait SignatureFetcher: Send + Sync {
    /// Signature entries to copy alongside the given image. An image
    /// without signatures yields an empty list.
    async fn fetch(&self, reference: &ImageRef) -> Result<Vec<UnprocessedImageRef>>;
}

/// Fetcher used when signature copying is disabled.
#[derive(Debug, Default)]
pub struct NoopSignatureFetcher;

#[async_trait]
impl SignatureFetcher for NoopSignatureFetcher {
    async fn fetch(&self, _reference: &ImageRef) -> Result<Vec<UnprocessedImageRef>> {
        Ok(Vec::new())
    }
}

/// Fetcher for cosign tag-convention signatures.
pub struct CosignSignatureFetcher {
    source: Arc<dyn Registry>,
}

impl CosignSignatureFetcher {
    pub fn new(source: Arc<dyn Registry>) -> Self {
        CosignSignatureFetcher { source }
    }
}

/// Tag under which cosign stores the signature of a digest.
pub fn cosign_signature_tag(digest_hex: &str) -> String {
    format!("sha256-{}.sig", digest_hex)
}

#[async_trait]
impl SignatureFetcher for CosignSignatureFetcher {
    async fn fetch(&self, reference: &ImageRef) -> Result<Vec<UnprocessedImageRef>> {
        let Some(hex) = reference.digest_hex() else {
            return Ok(Vec::new());
        };

        let sig_tag = cosign_signature_tag(hex);
        let sig_ref = reference.with_tag(&sig_tag);

        match self.source.get_manifest(&sig_ref).await {
            Ok(manifest) => {
                let digest_ref = format!(
                    "{}/{}@{}",
                    reference.registry, reference.repository, manifest.digest
                );
                let entry = UnprocessedImageRef::new(digest_ref, sig_tag)?;
                Ok(vec![entry])
            }
            Err(e) => {
                // Most images are unsigned; absence is not an error
                tracing::debug!(reference = %sig_ref, error = %e, "No signature found");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosign_signature_tag() {
        assert_eq!(
            cosign_signature_tag("669e010b"),
            "sha256-669e010b.sig"
        );
    }

    #[tokio::test]
    async fn test_noop_fetcher_returns_nothing() {
        let fetcher = NoopSignatureFetcher;
        let r = ImageRef::parse(&format!("registry.io/app@sha256:{}", "a".repeat(64))).unwrap();
        assert!(fetcher.fetch(&r).await.unwrap().is_empty());
    }
}
