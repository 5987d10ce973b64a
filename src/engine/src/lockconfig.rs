//! ImagesLock and BundleLock artifacts.
//!
//! These YAML documents appear in three places: on disk as user-supplied
//! copy input, on disk as the lock output of a copy, and embedded inside a
//! bundle image as `.imgpkg/images.yml`.

use std::collections::BTreeMap;
use std::path::Path;

use imgrelay_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// apiVersion shared by both lock kinds.
pub const LOCK_API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
/// kind of an images lock.
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";
/// kind of a bundle lock.
pub const BUNDLE_LOCK_KIND: &str = "BundleLock";

/// One image entry in an [`ImagesLock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRefLock {
    /// Digested reference of the image
    pub image: String,
    /// Free-form annotations, preserved across rewrites
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// An ordered list of image references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<ImageRefLock>,
}

impl ImagesLock {
    /// An empty lock with the current apiVersion and kind.
    pub fn new() -> Self {
        ImagesLock {
            api_version: LOCK_API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images: Vec::new(),
        }
    }

    /// Parse and validate lock content.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: ImagesLock = serde_yaml::from_slice(data)?;
        lock.validate()?;
        Ok(lock)
    }

    /// Read and validate a lock file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Serialize to YAML bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    /// Write to disk as YAML.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.api_version != LOCK_API_VERSION {
            return Err(RelayError::Lockfile(format!(
                "unsupported apiVersion '{}' (expected '{}')",
                self.api_version, LOCK_API_VERSION
            )));
        }
        if self.kind != IMAGES_LOCK_KIND {
            return Err(RelayError::Lockfile(format!(
                "unsupported kind '{}' (expected '{}')",
                self.kind, IMAGES_LOCK_KIND
            )));
        }
        Ok(())
    }
}

impl Default for ImagesLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference to a relocated bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRefLock {
    /// Digested reference of the bundle
    pub image: String,
    /// Tag the bundle carries at the destination
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// Lock output describing a single relocated bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleLock {
    pub api_version: String,
    pub kind: String,
    pub bundle: BundleRefLock,
}

impl BundleLock {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        BundleLock {
            api_version: LOCK_API_VERSION.to_string(),
            kind: BUNDLE_LOCK_KIND.to_string(),
            bundle: BundleRefLock {
                image: image.into(),
                tag: tag.into(),
            },
        }
    }

    /// Parse and validate lock content.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: BundleLock = serde_yaml::from_slice(data)?;
        if lock.api_version != LOCK_API_VERSION {
            return Err(RelayError::Lockfile(format!(
                "unsupported apiVersion '{}' (expected '{}')",
                lock.api_version, LOCK_API_VERSION
            )));
        }
        if lock.kind != BUNDLE_LOCK_KIND {
            return Err(RelayError::Lockfile(format!(
                "unsupported kind '{}' (expected '{}')",
                lock.kind, BUNDLE_LOCK_KIND
            )));
        }
        Ok(lock)
    }

    /// Read and validate a lock file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Write to disk as YAML.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// A lock file whose kind is not known in advance.
#[derive(Debug, Clone)]
pub enum Lock {
    Images(ImagesLock),
    Bundle(BundleLock),
}

impl Lock {
    /// Read a lock file from disk, sniffing its kind.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let head: serde_yaml::Value = serde_yaml::from_slice(&data)?;
        match head.get("kind").and_then(|k| k.as_str()) {
            Some(IMAGES_LOCK_KIND) => Ok(Lock::Images(ImagesLock::from_bytes(&data)?)),
            Some(BUNDLE_LOCK_KIND) => Ok(Lock::Bundle(BundleLock::from_bytes(&data)?)),
            Some(other) => Err(RelayError::Lockfile(format!(
                "unknown lock kind '{}' in {}",
                other,
                path.display()
            ))),
            None => Err(RelayError::Lockfile(format!(
                "missing kind in {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:669e010b58baf5beb2836b253c1fd5768333f0d1dbcb834f7c07a4dc93f474be";

    #[test]
    fn test_images_lock_roundtrip() {
        let mut lock = ImagesLock::new();
        lock.images.push(ImageRefLock {
            image: format!("registry.io/app@{DIGEST}"),
            annotations: BTreeMap::new(),
        });

        let bytes = lock.to_bytes().unwrap();
        let parsed = ImagesLock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, lock);
    }

    #[test]
    fn test_images_lock_preserves_order() {
        let yaml = format!(
            "apiVersion: {LOCK_API_VERSION}\nkind: {IMAGES_LOCK_KIND}\nimages:\n\
             - image: registry.io/zzz@{DIGEST}\n\
             - image: registry.io/aaa@{DIGEST}\n"
        );
        let lock = ImagesLock::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(lock.images[0].image, format!("registry.io/zzz@{DIGEST}"));
        assert_eq!(lock.images[1].image, format!("registry.io/aaa@{DIGEST}"));
    }

    #[test]
    fn test_images_lock_rejects_wrong_kind() {
        let yaml = format!("apiVersion: {LOCK_API_VERSION}\nkind: SomethingElse\nimages: []\n");
        assert!(ImagesLock::from_bytes(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_images_lock_rejects_wrong_api_version() {
        let yaml = format!("apiVersion: v9\nkind: {IMAGES_LOCK_KIND}\nimages: []\n");
        assert!(ImagesLock::from_bytes(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_bundle_lock_roundtrip() {
        let lock = BundleLock::new(format!("registry.io/bundle@{DIGEST}"), "v1");
        let yaml = serde_yaml::to_string(&lock).unwrap();
        let parsed = BundleLock::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(parsed, lock);
        assert!(yaml.contains("kind: BundleLock"));
        assert!(yaml.contains("tag: v1"));
    }

    #[test]
    fn test_lock_sniffs_kind() {
        let dir = tempfile::tempdir().unwrap();

        let images_path = dir.path().join("images.yml");
        ImagesLock::new().write_to_path(&images_path).unwrap();
        assert!(matches!(Lock::from_path(&images_path).unwrap(), Lock::Images(_)));

        let bundle_path = dir.path().join("bundle.yml");
        BundleLock::new(format!("registry.io/b@{DIGEST}"), "")
            .write_to_path(&bundle_path)
            .unwrap();
        assert!(matches!(Lock::from_path(&bundle_path).unwrap(), Lock::Bundle(_)));
    }

    #[test]
    fn test_lock_rejects_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.yml");
        std::fs::write(&path, "kind: ConfigMap\n").unwrap();
        assert!(Lock::from_path(&path).is_err());
    }

    #[test]
    fn test_annotations_preserved() {
        let yaml = format!(
            "apiVersion: {LOCK_API_VERSION}\nkind: {IMAGES_LOCK_KIND}\nimages:\n\
             - image: registry.io/app@{DIGEST}\n  annotations:\n    component: api\n"
        );
        let lock = ImagesLock::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(
            lock.images[0].annotations.get("component"),
            Some(&"api".to_string())
        );

        let out = String::from_utf8(lock.to_bytes().unwrap()).unwrap();
        assert!(out.contains("component: api"));
    }
}
