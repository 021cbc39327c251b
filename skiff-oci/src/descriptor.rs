//! OCI content descriptors and platform selectors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Digest;

/// A content-addressed reference to a blob: media type, digest, and size,
/// optionally qualified by platform and annotations.
///
/// Descriptors are created while walking manifests or after writing a
/// blob, and are immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest of the referenced bytes.
    pub digest: Digest,
    /// Size of the referenced bytes.
    pub size: i64,
    /// Alternate fetch locations for foreign content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary descriptor metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Platform the referenced manifest targets, for index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Creates a minimal descriptor with no annotations or platform.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// Returns an annotation value by key.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Sets an annotation, creating the map on first use.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }
}

/// The platform a manifest targets.
///
/// Architecture strings are canonicalized on construction so the rest of
/// the workspace only ever compares canonical names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Canonical CPU architecture (`amd64`, `arm64`, `arm`, `386`, ...).
    pub architecture: String,
    /// Operating system (`linux`).
    pub os: String,
    /// Architecture variant (`v8` for arm64, `v6`/`v7` for arm).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// OS version qualifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Required OS features.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
}

impl Platform {
    /// Creates a platform with canonicalized architecture.
    pub fn new(architecture: &str, os: &str, variant: Option<&str>) -> Self {
        Self {
            architecture: canonical_architecture(architecture).to_owned(),
            os: os.to_owned(),
            variant: variant.map(str::to_owned),
            os_version: None,
            os_features: None,
        }
    }

    /// `linux/amd64`.
    pub fn linux_amd64() -> Self {
        Self::new("amd64", "linux", None)
    }

    /// `linux/arm64/v8`.
    pub fn linux_arm64() -> Self {
        Self::new("arm64", "linux", Some("v8"))
    }

    /// The platform of the running host.
    pub fn host() -> Self {
        Self::new(std::env::consts::ARCH, "linux", None)
    }

    /// The variant used for comparisons.
    ///
    /// `arm64` with no variant is the same platform as `arm64/v8`.
    fn normalized_variant(&self) -> Option<&str> {
        match (self.architecture.as_str(), self.variant.as_deref()) {
            ("arm64", None) => Some("v8"),
            (_, v) => v,
        }
    }

    /// Returns `true` if `other` names the same platform as `self`.
    pub fn matches(&self, other: &Self) -> bool {
        self == other
    }

    /// Compatibility relation: can a host of platform `self` run content
    /// built for `other`?
    ///
    /// `amd64` accepts `386`; `arm/vN` accepts `arm/vM` for `M <= N`.
    pub fn compatible_with(&self, other: &Self) -> bool {
        if self.os != other.os {
            return false;
        }
        if self == other {
            return true;
        }
        match (self.architecture.as_str(), other.architecture.as_str()) {
            ("amd64", "386") => true,
            ("arm", "arm") => {
                let mine = arm_variant_level(self.normalized_variant());
                let theirs = arm_variant_level(other.normalized_variant());
                theirs <= mine
            }
            _ => false,
        }
    }
}

impl PartialEq for Platform {
    fn eq(&self, other: &Self) -> bool {
        self.architecture == other.architecture
            && self.os == other.os
            && self.normalized_variant() == other.normalized_variant()
            && self.os_version == other.os_version
    }
}

impl Eq for Platform {}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref v) = self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

/// Maps the architecture aliases seen in the wild onto canonical names.
pub fn canonical_architecture(arch: &str) -> &str {
    match arch {
        "arm" | "armhf" | "armel" => "arm",
        "x86_64" | "x86-64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        other => other,
    }
}

/// Numeric ordering for arm variants, unknown variants compare lowest.
fn arm_variant_level(variant: Option<&str>) -> u32 {
    match variant {
        Some(v) => v
            .strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
        None => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_architectures() {
        assert_eq!(Platform::new("x86_64", "linux", None).architecture, "amd64");
        assert_eq!(Platform::new("aarch64", "linux", None).architecture, "arm64");
        assert_eq!(Platform::new("armhf", "linux", None).architecture, "arm");
        assert_eq!(Platform::new("riscv64", "linux", None).architecture, "riscv64");
    }

    #[test]
    fn arm64_nil_variant_equals_v8() {
        let bare = Platform::new("arm64", "linux", None);
        let v8 = Platform::new("arm64", "linux", Some("v8"));
        assert_eq!(bare, v8);
        assert!(bare.matches(&v8));
        let v7 = Platform::new("arm64", "linux", Some("v7"));
        assert_ne!(bare, v7);
    }

    #[test]
    fn amd64_accepts_386() {
        let host = Platform::linux_amd64();
        let legacy = Platform::new("386", "linux", None);
        assert!(host.compatible_with(&legacy));
        assert!(!legacy.compatible_with(&host));
    }

    #[test]
    fn arm_variant_subset() {
        let v7 = Platform::new("arm", "linux", Some("v7"));
        let v6 = Platform::new("arm", "linux", Some("v6"));
        assert!(v7.compatible_with(&v6));
        assert!(!v6.compatible_with(&v7));
        assert!(v7.compatible_with(&v7));
    }

    #[test]
    fn os_must_match() {
        let linux = Platform::linux_amd64();
        let windows = Platform::new("amd64", "windows", None);
        assert!(!linux.compatible_with(&windows));
    }

    #[test]
    fn descriptor_serde_shape() {
        let d = Descriptor::new(
            "application/vnd.oci.image.manifest.v1+json",
            Digest::compute(b"x"),
            1,
        );
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("mediaType").is_some());
        assert!(json.get("annotations").is_none());
        assert!(json.get("platform").is_none());
        let back: Descriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn annotations_round_trip() {
        let mut d = Descriptor::new("application/octet-stream", Digest::compute(b"x"), 1);
        d.set_annotation("org.opencontainers.image.ref.name", "alpine:3.20");
        assert_eq!(
            d.annotation("org.opencontainers.image.ref.name"),
            Some("alpine:3.20")
        );
        assert_eq!(d.annotation("missing"), None);
    }
}
