//! The set of images discovered for copying.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use imgrelay_core::error::Result;

use crate::refs::ImageRef;

/// A single image discovered for copying, identified by digest and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedImageRef {
    /// Digested reference on the source side (`registry/repo@sha256:...`)
    pub digest_ref: String,
    /// Tag to recreate at the destination; may be empty
    pub tag: String,
    /// Labels carried through the copy (bundle markers among them)
    pub labels: HashMap<String, String>,
    /// The reference the user originally supplied, when this entry is a seed
    pub orig_ref: Option<String>,
}

impl UnprocessedImageRef {
    /// Build a validated entry. Fails unless `digest_ref` parses as a
    /// digested reference.
    pub fn new(digest_ref: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let entry = UnprocessedImageRef {
            digest_ref: digest_ref.into(),
            tag: tag.into(),
            labels: HashMap::new(),
            orig_ref: None,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Attach a label, consuming and returning the entry.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Attach the originally supplied reference.
    pub fn with_orig_ref(mut self, orig: impl Into<String>) -> Self {
        self.orig_ref = Some(orig.into());
        self
    }

    /// Key that uniquely identifies this entry within a set.
    pub fn key(&self) -> String {
        format!("{}:{}", self.digest_ref, self.tag)
    }

    /// Value of the given label, if present.
    pub fn label_value(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(|v| v.as_str())
    }

    /// Verify the digest reference parses and carries a digest.
    pub fn validate(&self) -> Result<()> {
        ImageRef::parse_digested(&self.digest_ref)?;
        Ok(())
    }
}

/// Thread-safe set of [`UnprocessedImageRef`] entries.
///
/// Insertion overwrites on key collision (last writer wins): equivalent
/// references are rediscovered through different traversal paths.
#[derive(Debug, Default)]
pub struct UnprocessedImageRefs {
    img_refs: Mutex<BTreeMap<String, UnprocessedImageRef>>,
}

impl UnprocessedImageRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert an entry.
    pub fn add(&self, img_ref: UnprocessedImageRef) -> Result<()> {
        img_ref.validate()?;
        let mut refs = self.img_refs.lock().unwrap();
        refs.insert(img_ref.key(), img_ref);
        Ok(())
    }

    /// Whether an entry with this exact key is already present.
    pub fn contains(&self, key: &str) -> bool {
        self.img_refs.lock().unwrap().contains_key(key)
    }

    /// Look up an entry by digest reference alone, ignoring the tag
    /// component of the key.
    pub fn find_by_digest_ref(&self, digest_ref: &str) -> Option<UnprocessedImageRef> {
        let refs = self.img_refs.lock().unwrap();
        let prefix = format!("{}:", digest_ref);
        refs.range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .next()
    }

    /// Number of entries at the moment of the call.
    pub fn len(&self) -> usize {
        self.img_refs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, sorted ascending by digest reference.
    pub fn all(&self) -> Vec<UnprocessedImageRef> {
        let refs = self.img_refs.lock().unwrap();
        let mut result: Vec<_> = refs.values().cloned().collect();
        result.sort_by(|a, b| a.digest_ref.cmp(&b.digest_ref));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> String {
        format!("sha256:{:064x}", n)
    }

    fn entry(repo: &str, n: u8, tag: &str) -> UnprocessedImageRef {
        UnprocessedImageRef::new(format!("registry.io/{}@{}", repo, digest(n)), tag).unwrap()
    }

    #[test]
    fn test_new_validates_digest() {
        assert!(UnprocessedImageRef::new("registry.io/app:v1", "v1").is_err());
        assert!(UnprocessedImageRef::new(format!("registry.io/app@{}", digest(1)), "").is_ok());
    }

    #[test]
    fn test_key_includes_tag() {
        let a = entry("app", 1, "v1");
        let b = entry("app", 1, "v2");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), format!("registry.io/app@{}:v1", digest(1)));
    }

    #[test]
    fn test_label_value() {
        let e = entry("app", 1, "v1").with_label("team", "infra");
        assert_eq!(e.label_value("team"), Some("infra"));
        assert_eq!(e.label_value("missing"), None);
    }

    #[test]
    fn test_add_rejects_invalid() {
        let set = UnprocessedImageRefs::new();
        let bad = UnprocessedImageRef {
            digest_ref: "registry.io/app:v1".to_string(),
            tag: String::new(),
            labels: HashMap::new(),
            orig_ref: None,
        };
        assert!(set.add(bad).is_err());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_add_overwrites_same_key() {
        let set = UnprocessedImageRefs::new();
        set.add(entry("app", 1, "v1")).unwrap();
        set.add(entry("app", 1, "v1").with_label("round", "two")).unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.all()[0].label_value("round"), Some("two"));
    }

    #[test]
    fn test_same_digest_distinct_tags_are_distinct_entries() {
        let set = UnprocessedImageRefs::new();
        set.add(entry("app", 1, "v1")).unwrap();
        set.add(entry("app", 1, "v2")).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_all_sorted_by_digest_ref() {
        let set = UnprocessedImageRefs::new();
        set.add(entry("zzz", 3, "")).unwrap();
        set.add(entry("aaa", 1, "")).unwrap();
        set.add(entry("mmm", 2, "")).unwrap();

        let all = set.all();
        let refs: Vec<_> = all.iter().map(|e| e.digest_ref.clone()).collect();
        let mut sorted = refs.clone();
        sorted.sort();
        assert_eq!(refs, sorted);
    }

    #[test]
    fn test_find_by_digest_ref_ignores_tag() {
        let set = UnprocessedImageRefs::new();
        set.add(entry("app", 1, "v1")).unwrap();

        let found = set
            .find_by_digest_ref(&format!("registry.io/app@{}", digest(1)))
            .unwrap();
        assert_eq!(found.tag, "v1");
        assert!(set
            .find_by_digest_ref(&format!("registry.io/app@{}", digest(2)))
            .is_none());
    }

    #[test]
    fn test_contains() {
        let set = UnprocessedImageRefs::new();
        let e = entry("app", 1, "v1");
        assert!(!set.contains(&e.key()));
        set.add(e.clone()).unwrap();
        assert!(set.contains(&e.key()));
    }
}
