//! Destination tag naming policies.

use imgrelay_core::error::Result;

use crate::imageset::UnprocessedImageRef;
use crate::refs::ImageRef;

/// Suffix appended to generated tags.
const GENERATED_TAG_SUFFIX: &str = ".imgpkg";

/// Maximum length of the slug portion of a repo-based tag. 49 keeps the
/// full `<slug>-sha256-<64 hex>.imgpkg` tag within the 128-character tag
/// limit.
const MAX_SLUG_LEN: usize = 49;

/// Policy for naming images at the destination repository.
///
/// Implementations must be deterministic: the same source entry always
/// yields the same tag.
pub trait TagGenerator: Send + Sync {
    /// Destination tag for the given source entry.
    fn generate(&self, source: &UnprocessedImageRef) -> Result<String>;
}

/// The tag an entry receives at the destination.
///
/// Digest-derived tags are computed from the destination digest, which
/// differs from the source digest for rewritten bundles; the repository
/// path fed to repo-based slugs stays the source one.
pub fn destination_tag(
    generator: &dyn TagGenerator,
    entry: &UnprocessedImageRef,
    dest_digest: &str,
) -> Result<String> {
    let src_ref = ImageRef::parse_digested(&entry.digest_ref)?;
    let tag_entry = UnprocessedImageRef {
        digest_ref: src_ref.with_digest(dest_digest).digest_ref()?,
        tag: entry.tag.clone(),
        labels: entry.labels.clone(),
        orig_ref: entry.orig_ref.clone(),
    };
    generator.generate(&tag_entry)
}

/// Keeps the source tag when present, otherwise derives
/// `sha256-<hex>.imgpkg` from the digest.
#[derive(Debug, Default)]
pub struct DefaultTagGenerator;

impl TagGenerator for DefaultTagGenerator {
    fn generate(&self, source: &UnprocessedImageRef) -> Result<String> {
        if !source.tag.is_empty() {
            return Ok(source.tag.clone());
        }
        let parsed = ImageRef::parse_digested(&source.digest_ref)?;
        let hex = parsed.digest_hex().unwrap_or_default();
        Ok(format!("sha256-{}{}", hex, GENERATED_TAG_SUFFIX))
    }
}

/// Derives `<slugified-source-path>-sha256-<hex>.imgpkg`, where the slug
/// is the source repository path with `/` replaced by `-`, truncated to
/// its last [`MAX_SLUG_LEN`] characters.
#[derive(Debug, Default)]
pub struct RepoBasedTagGenerator;

impl TagGenerator for RepoBasedTagGenerator {
    fn generate(&self, source: &UnprocessedImageRef) -> Result<String> {
        let parsed = ImageRef::parse_digested(&source.digest_ref)?;
        let hex = parsed.digest_hex().unwrap_or_default();

        let slug = parsed.repository.replace('/', "-");
        let slug = if slug.len() > MAX_SLUG_LEN {
            &slug[slug.len() - MAX_SLUG_LEN..]
        } else {
            &slug[..]
        };
        // Truncation can leave a separator first, which is not a valid
        // leading tag character
        let slug = slug.trim_start_matches(['-', '.']);

        Ok(format!("{}-sha256-{}{}", slug, hex, GENERATED_TAG_SUFFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "669e010b58baf5beb2836b253c1fd5768333f0d1dbcb834f7c07a4dc93f474be";

    fn entry(repo: &str, tag: &str) -> UnprocessedImageRef {
        UnprocessedImageRef::new(format!("registry.foo.bar/{}@sha256:{}", repo, DIGEST), tag)
            .unwrap()
    }

    #[test]
    fn test_default_keeps_source_tag() {
        let tag = DefaultTagGenerator.generate(&entry("some/app", "v1.2.3")).unwrap();
        assert_eq!(tag, "v1.2.3");
    }

    #[test]
    fn test_default_falls_back_to_digest_shorthand() {
        let tag = DefaultTagGenerator.generate(&entry("some/app", "")).unwrap();
        assert_eq!(tag, format!("sha256-{DIGEST}.imgpkg"));
    }

    #[test]
    fn test_repo_based_slugifies_path() {
        let tag = RepoBasedTagGenerator
            .generate(&entry("some/application/app", "v1"))
            .unwrap();
        assert_eq!(tag, format!("some-application-app-sha256-{DIGEST}.imgpkg"));
    }

    #[test]
    fn test_repo_based_truncates_to_last_49_chars() {
        let repo = "a-very/long/nested/path/of/repository/components/app";
        let tag = RepoBasedTagGenerator.generate(&entry(repo, "")).unwrap();

        let slug = tag.split("-sha256-").next().unwrap();
        assert!(slug.len() <= 49, "slug '{}' is {} chars", slug, slug.len());

        let full_slug = repo.replace('/', "-");
        assert!(full_slug.ends_with(slug));
        assert!(tag.ends_with(&format!("-sha256-{DIGEST}.imgpkg")));
    }

    #[test]
    fn test_repo_based_fits_tag_length_limit() {
        let repo = format!("{}/app", "x".repeat(120));
        let tag = RepoBasedTagGenerator.generate(&entry(&repo, "")).unwrap();
        assert!(tag.len() <= 128, "tag '{}' is {} chars", tag, tag.len());
    }

    #[test]
    fn test_repo_based_trims_leading_separator() {
        // 49-char cut lands right on a path separator
        let repo = format!("{}/{}", "a".repeat(30), "b".repeat(48));
        let tag = RepoBasedTagGenerator.generate(&entry(&repo, "")).unwrap();
        let slug = tag.split("-sha256-").next().unwrap();
        assert!(slug.starts_with('b'), "slug '{}' should not start with '-'", slug);
    }

    #[test]
    fn test_generators_are_deterministic() {
        let e = entry("some/app", "");
        assert_eq!(
            DefaultTagGenerator.generate(&e).unwrap(),
            DefaultTagGenerator.generate(&e).unwrap()
        );
        assert_eq!(
            RepoBasedTagGenerator.generate(&e).unwrap(),
            RepoBasedTagGenerator.generate(&e).unwrap()
        );
    }
}
