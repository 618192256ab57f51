//! Schema-tolerant parsing of Docker configuration files.
//!
//! Docker has shipped more than one generation of its per-container
//! configuration schema.  Each decoder here is independent: the newer v2
//! schema (`config.v2.json`) is fully modeled, the legacy v1 schema
//! (`config.json`) is recognized but not parsed.  Unknown fields are
//! ignored everywhere so that configs written by newer daemons still
//! decode.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Newer-generation container configuration filename.
pub const CONFIG_V2_FILENAME: &str = "config.v2.json";
/// Legacy first-generation container configuration filename.
pub const CONFIG_V1_FILENAME: &str = "config.json";

/// Configuration bytes did not decode against a recognized schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("configuration does not match any recognized schema")]
    Unrecognized(#[source] serde_json::Error),
    #[error("legacy v1 container configuration is not supported")]
    LegacyUnsupported,
    #[error("digest {0:?} must be exactly two colon-separated fields")]
    MalformedDigest(String),
}

/// Canonical view of one container, independent of the source schema
/// generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    /// Container identifier, unique per runtime namespace.
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Image reference the container was created from.
    pub image: String,
    /// Storage driver name, e.g. "overlay2".
    pub driver: String,
    pub hostname: String,
    /// Declared exposed ports, e.g. "80/tcp".  Source ordering is not
    /// significant.
    pub exposed_ports: BTreeSet<String>,
    pub running: bool,
    /// Runtime name, e.g. "/nginx-proxy".
    pub name: String,
}

/// An algorithm-prefixed content digest, e.g. "sha256:4e67...".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

impl FromStr for Digest {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, SchemaError> {
        match s.split_once(':') {
            Some((algorithm, encoded))
                if !algorithm.is_empty() && !encoded.is_empty() && !encoded.contains(':') =>
            {
                Ok(Digest {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(SchemaError::MalformedDigest(s.to_string())),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

/// One (name, digest) binding from a repositories index.  Multiple
/// records may share a digest (tag aliasing); uniqueness is per pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Human-readable name, e.g. "ubuntu:22.04".
    pub name: String,
    pub digest: Digest,
    /// Populated only when a matching content summary was found.
    pub created_at: Option<DateTime<Utc>>,
}

/// Image metadata stored content-addressed under
/// `image/<driver>/imagedb/content/<algo>/<encoded>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageContentSummary {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub rootfs: RootFs,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// `repositories.json`: image name mapped to a nested tag-to-digest
/// mapping, one file per storage-driver namespace.
#[derive(Debug, Default, Deserialize)]
pub struct RepositoryIndex {
    #[serde(rename = "Repositories", default)]
    pub repositories: BTreeMap<String, BTreeMap<String, String>>,
}

// The v2 schema, as written by dockerd.  Only the fields the canonical
// model needs; everything else is ignored.
#[derive(Deserialize)]
struct ConfigV2 {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Created")]
    created: DateTime<Utc>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: StateV2,
    #[serde(rename = "Config", default)]
    config: InnerConfigV2,
}

#[derive(Deserialize, Default)]
struct StateV2 {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Deserialize, Default)]
struct InnerConfigV2 {
    #[serde(rename = "Hostname", default)]
    hostname: String,
    // Values in the port mapping carry no information; only the keys
    // matter.
    #[serde(rename = "ExposedPorts", default)]
    exposed_ports: Option<BTreeMap<String, serde::de::IgnoredAny>>,
}

/// Decode a v2 container configuration into the canonical record.
///
/// Pure transform over bytes already read by the caller.
pub fn parse_container_config(data: &[u8]) -> Result<ContainerRecord, SchemaError> {
    let config: ConfigV2 = serde_json::from_slice(data).map_err(SchemaError::Unrecognized)?;

    let exposed_ports = config
        .config
        .exposed_ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();

    Ok(ContainerRecord {
        id: config.id,
        created_at: config.created,
        image: config.image,
        driver: config.driver,
        hostname: config.config.hostname,
        exposed_ports,
        running: config.state.running,
        name: config.name,
    })
}

/// Decode a legacy v1 container configuration.
///
/// The v1 schema is recognized so that the caller can apply its
/// precedence rule, but decoding it is explicitly unsupported.
pub fn parse_container_config_v1(_data: &[u8]) -> Result<ContainerRecord, SchemaError> {
    Err(SchemaError::LegacyUnsupported)
}

/// Decode an image content summary file.
pub fn parse_image_content(data: &[u8]) -> Result<ImageContentSummary, SchemaError> {
    serde_json::from_slice(data).map_err(SchemaError::Unrecognized)
}

/// Decode a `repositories.json` index file.
pub fn parse_repository_index(data: &[u8]) -> Result<RepositoryIndex, SchemaError> {
    serde_json::from_slice(data).map_err(SchemaError::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2_CONFIG: &str = r#"{
        "ID": "8c7a9e2b1f3d",
        "Created": "2023-04-05T06:07:08.123456789Z",
        "Image": "sha256:b5a2c9e1d4f6",
        "Driver": "overlay2",
        "Name": "/web-frontend",
        "State": {"Running": true, "Pid": 4242},
        "Config": {
            "Hostname": "8c7a9e2b1f3d",
            "ExposedPorts": {"80/tcp": {}, "443/tcp": {}},
            "SomeFutureField": [1, 2, 3]
        },
        "AnotherFutureField": {"nested": true}
    }"#;

    #[test]
    fn v2_config_decodes_to_canonical_record() {
        let record = parse_container_config(V2_CONFIG.as_bytes()).unwrap();
        assert_eq!(record.id, "8c7a9e2b1f3d");
        assert_eq!(record.image, "sha256:b5a2c9e1d4f6");
        assert_eq!(record.driver, "overlay2");
        assert_eq!(record.name, "/web-frontend");
        assert_eq!(record.hostname, "8c7a9e2b1f3d");
        assert!(record.running);
        let ports: Vec<&str> = record.exposed_ports.iter().map(String::as_str).collect();
        assert_eq!(ports, ["443/tcp", "80/tcp"]);
    }

    #[test]
    fn missing_optional_sections_default() {
        let minimal = r#"{"ID": "abc", "Created": "2020-01-01T00:00:00Z"}"#;
        let record = parse_container_config(minimal.as_bytes()).unwrap();
        assert_eq!(record.id, "abc");
        assert!(!record.running);
        assert!(record.exposed_ports.is_empty());
        assert_eq!(record.hostname, "");
    }

    #[test]
    fn malformed_config_is_a_schema_error() {
        let err = parse_container_config(b"{\"ID\": 17}").unwrap_err();
        assert!(matches!(err, SchemaError::Unrecognized(_)));
    }

    #[test]
    fn v1_config_is_recognized_but_unsupported() {
        let err = parse_container_config_v1(b"{}").unwrap_err();
        assert!(matches!(err, SchemaError::LegacyUnsupported));
    }

    #[test]
    fn digest_requires_two_fields() {
        let digest: Digest = "sha256:abcd".parse().unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.encoded, "abcd");
        assert_eq!(digest.to_string(), "sha256:abcd");

        assert!("sha256".parse::<Digest>().is_err());
        assert!("sha256:".parse::<Digest>().is_err());
        assert!(":abcd".parse::<Digest>().is_err());
        assert!("a:b:c".parse::<Digest>().is_err());
    }

    #[test]
    fn image_content_summary_decodes() {
        let data = r#"{
            "architecture": "amd64",
            "os": "linux",
            "created": "2022-11-12T13:14:15Z",
            "history": [
                {"created": "2022-11-12T13:14:15Z", "created_by": "/bin/sh -c #(nop) ADD file:..."},
                {"created": "2022-11-12T13:14:16Z", "comment": "buildkit", "empty_layer": true}
            ],
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aa", "sha256:bb"]},
            "parent": "sha256:99",
            "docker_version": "20.10.17"
        }"#;
        let summary = parse_image_content(data.as_bytes()).unwrap();
        assert_eq!(summary.architecture, "amd64");
        assert_eq!(summary.os, "linux");
        assert_eq!(summary.history.len(), 2);
        assert!(summary.history[1].empty_layer);
        assert_eq!(summary.rootfs.fs_type, "layers");
        assert_eq!(summary.rootfs.diff_ids, ["sha256:aa", "sha256:bb"]);
        assert_eq!(summary.parent.as_deref(), Some("sha256:99"));
    }

    #[test]
    fn repository_index_decodes() {
        let data = r#"{"Repositories": {
            "ubuntu": {"ubuntu:22.04": "sha256:11", "ubuntu:latest": "sha256:11"},
            "nginx": {"nginx:alpine": "sha256:22"}
        }}"#;
        let index = parse_repository_index(data.as_bytes()).unwrap();
        assert_eq!(index.repositories.len(), 2);
        assert_eq!(index.repositories["ubuntu"].len(), 2);
    }
}
