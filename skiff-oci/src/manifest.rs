//! OCI image-spec JSON documents: indexes, manifests, image configs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Descriptor, Digest, Platform};

/// Media type strings this library produces and consumes.
pub mod media_types {
    /// OCI image index.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image manifest.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// Docker schema-2 manifest list.
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker schema-2 manifest.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// OCI image configuration blob.
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// Docker image configuration blob.
    pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Gzip-compressed tar layer.
    pub const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// Uncompressed tar layer.
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    /// Docker gzip-compressed layer.
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    /// ORAS artifact manifest; not handled, reported as unsupported.
    pub const ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
    /// Notary signature payload; not handled, reported as unsupported.
    pub const NOTARY_SIGNATURE: &str = "application/vnd.cncf.notary.signature";
    /// Docker foreign layer, skipped during walks.
    pub const DOCKER_FOREIGN_LAYER: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    /// OCI non-distributable layer prefix, skipped during walks.
    pub const NONDISTRIBUTABLE_PREFIX: &str =
        "application/vnd.oci.image.layer.nondistributable.v1";

    /// The Accept list sent when resolving tags.
    pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
         application/vnd.oci.image.manifest.v1+json, \
         application/vnd.docker.distribution.manifest.list.v2+json, \
         application/vnd.docker.distribution.manifest.v2+json, */*";

    /// Returns `true` for index / manifest-list media types.
    pub fn is_index(media_type: &str) -> bool {
        media_type == INDEX || media_type == DOCKER_MANIFEST_LIST
    }

    /// Returns `true` for single-image manifest media types.
    pub fn is_manifest(media_type: &str) -> bool {
        media_type == MANIFEST || media_type == DOCKER_MANIFEST
    }

    /// Returns `true` for media types a reference may point at.
    pub fn is_image_target(media_type: &str) -> bool {
        is_index(media_type) || is_manifest(media_type)
    }

    /// Returns `true` for artifact kinds this library refuses to walk.
    pub fn is_unsupported(media_type: &str) -> bool {
        media_type == ARTIFACT_MANIFEST || media_type == NOTARY_SIGNATURE
    }

    /// Returns `true` for layers that must not be fetched from the
    /// registry that served their manifest.
    pub fn is_foreign_layer(media_type: &str) -> bool {
        media_type == DOCKER_FOREIGN_LAYER || media_type.starts_with(NONDISTRIBUTABLE_PREFIX)
    }

    /// Manifest-like content lives under `/manifests/`, blobs under
    /// `/blobs/`.
    pub fn is_manifest_path(media_type: &str) -> bool {
        is_image_target(media_type) || media_type == ARTIFACT_MANIFEST
    }
}

/// An image index: a manifest-of-manifests, typically one per platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Always 2.
    pub schema_version: u32,
    /// `application/vnd.oci.image.index.v1+json` when emitted by us.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Per-platform manifest descriptors.
    pub manifests: Vec<Descriptor>,
    /// Index-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Index {
    /// Creates an index over the given manifest descriptors.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::INDEX.to_owned()),
            manifests,
            annotations: None,
        }
    }
}

/// A single-platform image manifest: config plus ordered layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    pub schema_version: u32,
    /// Manifest media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The image configuration blob.
    pub config: Descriptor,
    /// Filesystem layers, base first.
    pub layers: Vec<Descriptor>,
    /// Manifest-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Creates a manifest over a config and its layers.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_owned()),
            config,
            layers,
            annotations: None,
        }
    }
}

/// The OCI image configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Target CPU architecture.
    pub architecture: String,
    /// Target operating system.
    pub os: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Required OS features.
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    /// Creation timestamp, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Execution defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    /// Uncompressed layer digests, base first.
    pub rootfs: RootFs,
}

impl ImageConfig {
    /// The platform this config was built for.
    pub fn platform(&self) -> Platform {
        let mut platform = Platform::new(&self.architecture, &self.os, self.variant.as_deref());
        platform.os_features = self.os_features.clone();
        platform
    }
}

/// The `rootfs` section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Digests of the uncompressed layer tars, base first.
    pub diff_ids: Vec<Digest>,
}

impl RootFs {
    /// A `layers`-typed rootfs over the given diff IDs.
    pub fn layers(diff_ids: Vec<Digest>) -> Self {
        Self {
            kind: "layers".to_owned(),
            diff_ids,
        }
    }
}

/// Subset of the execution defaults relevant to VM hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default command (`CMD`).
    #[serde(default, rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(default, rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default environment variables.
    #[serde(default, rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Default working directory.
    #[serde(default, rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Default user.
    #[serde(default, rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Exposed ports (`EXPOSE`).
    #[serde(default, rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<serde_json::Value>,
}

impl RuntimeConfig {
    /// The combined entrypoint + cmd, as executed in the guest.
    pub fn command(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(ref ep) = self.entrypoint {
            parts.extend(ep.iter().cloned());
        }
        if let Some(ref cmd) = self.cmd {
            parts.extend(cmd.iter().cloned());
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_classification() {
        assert!(media_types::is_index(media_types::INDEX));
        assert!(media_types::is_index(media_types::DOCKER_MANIFEST_LIST));
        assert!(media_types::is_manifest(media_types::MANIFEST));
        assert!(media_types::is_manifest(media_types::DOCKER_MANIFEST));
        assert!(!media_types::is_index(media_types::MANIFEST));
        assert!(media_types::is_image_target(media_types::DOCKER_MANIFEST));
        assert!(!media_types::is_image_target(media_types::IMAGE_CONFIG));
        assert!(media_types::is_unsupported(media_types::ARTIFACT_MANIFEST));
        assert!(media_types::is_foreign_layer(media_types::DOCKER_FOREIGN_LAYER));
        assert!(media_types::is_foreign_layer(
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
        ));
        assert!(!media_types::is_foreign_layer(media_types::LAYER_GZIP));
    }

    #[test]
    fn manifest_json_shape() {
        let manifest = Manifest::new(
            Descriptor::new(media_types::IMAGE_CONFIG, Digest::compute(b"cfg"), 3),
            vec![Descriptor::new(
                media_types::LAYER_GZIP,
                Digest::compute(b"layer"),
                5,
            )],
        );
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], media_types::MANIFEST);
        assert_eq!(json["layers"][0]["size"], 5);
        let back: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn config_platform_extraction() {
        let config = ImageConfig {
            architecture: "aarch64".to_owned(),
            os: "linux".to_owned(),
            variant: Some("v8".to_owned()),
            os_features: None,
            created: None,
            config: None,
            rootfs: RootFs::layers(vec![Digest::compute(b"layer")]),
        };
        let platform = config.platform();
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform, Platform::linux_arm64());
    }

    #[test]
    fn runtime_config_command_merges() {
        let config = RuntimeConfig {
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            cmd: Some(vec!["echo hi".into()]),
            ..RuntimeConfig::default()
        };
        assert_eq!(config.command(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn docker_config_aliases_parse() {
        let raw = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Cmd": ["/bin/sh"], "Env": ["PATH=/usr/bin"] },
            "rootfs": { "type": "layers", "diff_ids": [
                "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            ]}
        });
        let config: ImageConfig = serde_json::from_value(raw).unwrap();
        let runtime = config.config.unwrap();
        assert_eq!(runtime.cmd.unwrap(), vec!["/bin/sh"]);
        assert_eq!(config.rootfs.diff_ids.len(), 1);
    }
}
