//! OCI image reference parsing.
//!
//! Parses references like `registry.example.com/team/app@sha256:abc...` or
//! `registry.example.com:5000/app:v1` into structured components. Copy
//! sources and closure entries must carry a digest; `validate_digested`
//! enforces that at the library boundary.

use imgrelay_core::error::{RelayError, Result};

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname, possibly with a port (e.g., "registry.io:5000")
    pub registry: String,
    /// Repository path (e.g., "team/app")
    pub repository: String,
    /// Tag (e.g., "v1.2.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `registry.io/org/image:tag`
    /// - `registry.io/org/image@sha256:abc...`
    /// - `registry.io/org/image:tag@sha256:abc...`
    /// - `registry.io:5000/image` (port disambiguated from tag)
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RelayError::Reference {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(RelayError::Reference {
                    reference: reference.to_string(),
                    reason: "digest must have the form algorithm:hex".to_string(),
                });
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag: the last colon after the last slash separates the tag,
        // otherwise a colon belongs to the registry port
        let (name, tag) = if let Some(slash_pos) = name_tag.rfind('/') {
            let after_slash = &name_tag[slash_pos + 1..];
            if let Some(colon_pos) = after_slash.rfind(':') {
                let tag = &after_slash[colon_pos + 1..];
                let name = &name_tag[..slash_pos + 1 + colon_pos];
                (name.to_string(), Some(tag.to_string()))
            } else {
                (name_tag.to_string(), None)
            }
        } else if let Some(colon_pos) = name_tag.rfind(':') {
            let after_colon = &name_tag[colon_pos + 1..];
            if after_colon.chars().all(|c| c.is_ascii_digit()) {
                // Looks like a port, treat the whole thing as the name
                (name_tag.to_string(), None)
            } else {
                (name_tag[..colon_pos].to_string(), Some(after_colon.to_string()))
            }
        } else {
            (name_tag.to_string(), None)
        };

        let (registry, repository) = split_registry_repository(&name, reference)?;

        Ok(ImageRef {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Parse a reference and require it to carry a digest.
    pub fn parse_digested(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        parsed.validate_digested()?;
        Ok(parsed)
    }

    /// Verify that this reference carries a well-formed sha256 digest.
    pub fn validate_digested(&self) -> Result<()> {
        let digest = self.digest.as_deref().ok_or_else(|| RelayError::MissingDigest {
            reference: self.to_string(),
            reason: "digest must be provided".to_string(),
        })?;

        let hex_part = digest.strip_prefix("sha256:").ok_or_else(|| RelayError::MissingDigest {
            reference: self.to_string(),
            reason: format!("unsupported digest algorithm in '{}'", digest),
        })?;

        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RelayError::MissingDigest {
                reference: self.to_string(),
                reason: format!("'{}' is not a sha256 hex digest", digest),
            });
        }

        Ok(())
    }

    /// Render `registry/repository@digest`, dropping any tag.
    ///
    /// Only valid for references that carry a digest.
    pub fn digest_ref(&self) -> Result<String> {
        self.validate_digested()?;
        Ok(format!(
            "{}/{}@{}",
            self.registry,
            self.repository,
            self.digest.as_deref().unwrap_or_default()
        ))
    }

    /// Return a copy of this reference pointing at the given digest,
    /// with no tag.
    pub fn with_digest(&self, digest: &str) -> ImageRef {
        ImageRef {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Return a copy of this reference pointing at the given tag,
    /// with no digest.
    pub fn with_tag(&self, tag: &str) -> ImageRef {
        ImageRef {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// The digest hex portion without the `sha256:` prefix, if present.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest.as_deref().and_then(|d| d.strip_prefix("sha256:"))
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split a name into registry and repository components.
///
/// The first path component is the registry; copy sources and destinations
/// are always fully qualified, so no default registry is assumed.
fn split_registry_repository(name: &str, original: &str) -> Result<(String, String)> {
    let slash_pos = name.find('/').ok_or_else(|| RelayError::Reference {
        reference: original.to_string(),
        reason: "expected registry/repository".to_string(),
    })?;

    let registry = name[..slash_pos].to_string();
    let repository = name[slash_pos + 1..].to_string();

    if registry.is_empty() || repository.is_empty() {
        return Err(RelayError::Reference {
            reference: original.to_string(),
            reason: "registry and repository must be non-empty".to_string(),
        });
    }

    Ok((registry, repository))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:669e010b58baf5beb2836b253c1fd5768333f0d1dbcb834f7c07a4dc93f474be";

    #[test]
    fn test_parse_with_tag() {
        let r = ImageRef::parse("registry.io/org/app:v1.2").unwrap();
        assert_eq!(r.registry, "registry.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, Some("v1.2".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_with_digest() {
        let r = ImageRef::parse(&format!("registry.io/org/app@{DIGEST}")).unwrap();
        assert_eq!(r.registry, "registry.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some(DIGEST.to_string()));
    }

    #[test]
    fn test_parse_with_tag_and_digest() {
        let r = ImageRef::parse(&format!("registry.io/org/app:v1@{DIGEST}")).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some(DIGEST.to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageRef::parse("registry.io:5000/app:v1").unwrap();
        assert_eq!(r.registry, "registry.io:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_deep_repository_path() {
        let r = ImageRef::parse("registry.foo.bar/some/application/app").unwrap();
        assert_eq!(r.registry, "registry.foo.bar");
        assert_eq!(r.repository, "some/application/app");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("   ").is_err());
    }

    #[test]
    fn test_parse_missing_repository() {
        assert!(ImageRef::parse("just-a-name").is_err());
        assert!(ImageRef::parse("registry.io/").is_err());
    }

    #[test]
    fn test_parse_invalid_digest_format() {
        assert!(ImageRef::parse("registry.io/app@invaliddigest").is_err());
    }

    #[test]
    fn test_validate_digested_rejects_tag_only() {
        let r = ImageRef::parse("registry.io/app:v1").unwrap();
        let err = r.validate_digested().unwrap_err();
        assert!(matches!(err, RelayError::MissingDigest { .. }));
    }

    #[test]
    fn test_validate_digested_rejects_short_hex() {
        let r = ImageRef::parse("registry.io/app@sha256:abc123").unwrap();
        assert!(r.validate_digested().is_err());
    }

    #[test]
    fn test_validate_digested_rejects_other_algorithms() {
        let r = ImageRef::parse(&format!("registry.io/app@sha512:{}", "a".repeat(128))).unwrap();
        assert!(r.validate_digested().is_err());
    }

    #[test]
    fn test_digest_ref_drops_tag() {
        let r = ImageRef::parse(&format!("registry.io/org/app:v1@{DIGEST}")).unwrap();
        assert_eq!(r.digest_ref().unwrap(), format!("registry.io/org/app@{DIGEST}"));
    }

    #[test]
    fn test_with_digest_and_with_tag() {
        let r = ImageRef::parse("registry.io/app:v1").unwrap();
        let digested = r.with_digest(DIGEST);
        assert_eq!(digested.digest, Some(DIGEST.to_string()));
        assert_eq!(digested.tag, None);

        let tagged = digested.with_tag("other");
        assert_eq!(tagged.tag, Some("other".to_string()));
        assert_eq!(tagged.digest, None);
    }

    #[test]
    fn test_digest_hex() {
        let r = ImageRef::parse(&format!("registry.io/app@{DIGEST}")).unwrap();
        assert_eq!(r.digest_hex(), Some(&DIGEST[7..]));
    }

    #[test]
    fn test_display() {
        let r = ImageRef::parse("registry.io:5000/org/app:v1").unwrap();
        assert_eq!(format!("{}", r), "registry.io:5000/org/app:v1");
    }
}
