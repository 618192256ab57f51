//! Resolution of a container's overlay layer chain.
//!
//! A container's public identifier does not name its storage directory
//! directly: the `mount-id` file under the driver's `layerdb` redirects
//! to the working directory, and that directory's `lower` file lists the
//! read-only parent layers as colon-separated relative identifiers.
//! The order of that list is the union-mount precedence order and is
//! preserved exactly as read.

use std::{fs, io, path::{Path, PathBuf}};

use log::debug;
use thiserror::Error;

use crate::config::{parse_container_config, SchemaError, CONFIG_V2_FILENAME};

/// Layer-resolution failures, one per step of the chain.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("container {id} not found")]
    ContainerNotFound { id: String },
    #[error("container {id} configuration")]
    Schema {
        id: String,
        #[source]
        source: SchemaError,
    },
    #[error("mount id for container {id} unavailable")]
    MountIdUnavailable {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("layer chain for mount id {mount_id} unavailable")]
    LayerChainUnavailable {
        mount_id: String,
        #[source]
        source: io::Error,
    },
}

/// The resolved overlay directories for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerChain {
    /// Read-only parent layers, outermost first, exactly in the order
    /// the `lower` file lists them.  May be empty for a container built
    /// from scratch.
    pub lower: Vec<PathBuf>,
    /// The container's own read-write layer.
    pub upper: PathBuf,
    /// The driver's scratch directory.
    pub work: PathBuf,
}

/// Resolve the ordered layer chain for `container_id` under the Docker
/// root directory.
pub fn resolve_layers(root: &Path, container_id: &str) -> Result<LayerChain, LayerError> {
    // The storage driver name comes from the container's own config.
    let config_path = root
        .join("containers")
        .join(container_id)
        .join(CONFIG_V2_FILENAME);
    let config_bytes = fs::read(&config_path).map_err(|_| LayerError::ContainerNotFound {
        id: container_id.to_string(),
    })?;
    let record = parse_container_config(&config_bytes).map_err(|source| LayerError::Schema {
        id: container_id.to_string(),
        source,
    })?;
    let driver = &record.driver;

    let mount_id_path = root
        .join("image")
        .join(driver)
        .join("layerdb")
        .join("mounts")
        .join(container_id)
        .join("mount-id");
    let mount_id = fs::read_to_string(&mount_id_path)
        .map_err(|source| LayerError::MountIdUnavailable {
            id: container_id.to_string(),
            source,
        })?
        .trim()
        .to_string();
    debug!("container {container_id} mount id {mount_id}");

    let lower_path = root.join(driver).join(&mount_id).join("lower");
    let lower_data =
        fs::read_to_string(&lower_path).map_err(|source| LayerError::LayerChainUnavailable {
            mount_id: mount_id.clone(),
            source,
        })?;
    let lower_data = lower_data.trim();

    // An empty lower file is a valid zero-parent chain, not an error.
    let lower: Vec<PathBuf> = if lower_data.is_empty() {
        Vec::new()
    } else {
        lower_data
            .split(':')
            .map(|layer| root.join(driver).join(layer))
            .collect()
    };

    let workdir = root.join(driver).join(&mount_id);
    let chain = LayerChain {
        lower,
        upper: workdir.join("diff"),
        work: workdir.join("work"),
    };
    debug!(
        "container {container_id} overlay directories: lower {:?} upper {:?} work {:?}",
        chain.lower, chain.upper, chain.work
    );
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const MOUNT_ID: &str = "f00dfeedmountid";

    fn config_json(id: &str) -> String {
        format!(
            r#"{{"ID": "{id}", "Created": "2023-01-02T03:04:05Z", "Driver": "overlay2"}}"#
        )
    }

    fn fixture_root(id: &str, lower: &str) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();

        let container_dir = root.join("containers").join(id);
        fs::create_dir_all(&container_dir).unwrap();
        fs::write(container_dir.join(CONFIG_V2_FILENAME), config_json(id)).unwrap();

        let mounts_dir = root.join("image/overlay2/layerdb/mounts").join(id);
        fs::create_dir_all(&mounts_dir).unwrap();
        fs::write(mounts_dir.join("mount-id"), format!("{MOUNT_ID}\n")).unwrap();

        let workdir = root.join("overlay2").join(MOUNT_ID);
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("lower"), lower).unwrap();

        dir
    }

    #[test]
    fn resolves_three_layers_in_file_order() {
        let dir = fixture_root("cafe01", "l/CCC:l/AAA:l/BBB");
        let chain = resolve_layers(dir.path(), "cafe01").unwrap();

        let driver_root = dir.path().join("overlay2");
        assert_eq!(
            chain.lower,
            [
                driver_root.join("l/CCC"),
                driver_root.join("l/AAA"),
                driver_root.join("l/BBB"),
            ]
        );
        assert_eq!(chain.upper, driver_root.join(MOUNT_ID).join("diff"));
        assert_eq!(chain.work, driver_root.join(MOUNT_ID).join("work"));
    }

    #[test]
    fn empty_lower_file_yields_empty_chain() {
        let dir = fixture_root("cafe02", "");
        let chain = resolve_layers(dir.path(), "cafe02").unwrap();
        assert!(chain.lower.is_empty());
        assert_eq!(
            chain.upper,
            dir.path().join("overlay2").join(MOUNT_ID).join("diff")
        );
    }

    #[test]
    fn unknown_container_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = resolve_layers(dir.path(), "missing").unwrap_err();
        assert!(matches!(err, LayerError::ContainerNotFound { .. }));
    }

    #[test]
    fn missing_mount_id_file() {
        let dir = fixture_root("cafe03", "l/AAA");
        fs::remove_file(
            dir.path()
                .join("image/overlay2/layerdb/mounts/cafe03/mount-id"),
        )
        .unwrap();
        let err = resolve_layers(dir.path(), "cafe03").unwrap_err();
        assert!(matches!(err, LayerError::MountIdUnavailable { .. }));
    }

    #[test]
    fn missing_lower_file() {
        let dir = fixture_root("cafe04", "l/AAA");
        fs::remove_file(dir.path().join("overlay2").join(MOUNT_ID).join("lower")).unwrap();
        let err = resolve_layers(dir.path(), "cafe04").unwrap_err();
        assert!(matches!(err, LayerError::LayerChainUnavailable { .. }));
    }

    #[test]
    fn malformed_config_is_a_schema_error() {
        let dir = fixture_root("cafe05", "l/AAA");
        fs::write(
            dir.path().join("containers/cafe05").join(CONFIG_V2_FILENAME),
            "not json",
        )
        .unwrap();
        let err = resolve_layers(dir.path(), "cafe05").unwrap_err();
        assert!(matches!(err, LayerError::Schema { .. }));
    }
}
