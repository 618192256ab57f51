//! The top-level explorer: construction, inventory and mounting.
//!
//! One [`Explorer`] owns exactly one long-lived resource, the handle on
//! the metadata database, opened at construction and released by
//! [`Explorer::close`].  Everything else is read per call.  The whole
//! API is synchronous; callers needing responsiveness run the explorer
//! on a worker thread of their own and use the [`CancelToken`].

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
    boltdb::{MetadataStore, StoreError},
    cancel::CancelToken,
    catalog::{Catalog, CatalogError},
    config::{ContainerRecord, ImageRecord},
    layers::{resolve_layers, LayerChain, LayerError},
    mount::{MountEngine, MountError, MountFacility},
};

/// Umbrella error for the explorer API.
#[derive(Error, Debug)]
pub enum ExplorerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Mount(#[from] MountError),
    /// Returned by stubbed collaborators instead of silently empty
    /// results, so missing functionality never masquerades as "nothing
    /// found".
    #[error("{0} is not supported by the offline explorer")]
    Unsupported(&'static str),
    #[error("operation cancelled")]
    Cancelled,
}

/// Offline explorer over one acquired Docker state directory.
#[derive(Debug)]
pub struct Explorer {
    root: PathBuf,
    runtime_root: PathBuf,
    layer_store: String,
    store: MetadataStore,
}

impl Explorer {
    /// Open an explorer over `root` (the Docker state directory, e.g.
    /// `/var/lib/docker`).  `runtime_root` is the containerd state
    /// directory, `metadata_path` the containerd metadata database
    /// (opened strictly read-only), and `layer_store` the layered
    /// filesystem driver namespace, e.g. "overlay2".
    pub fn new(
        root: impl Into<PathBuf>,
        runtime_root: impl Into<PathBuf>,
        metadata_path: impl AsRef<Path>,
        layer_store: impl Into<String>,
    ) -> Result<Explorer, StoreError> {
        Ok(Explorer {
            root: root.into(),
            runtime_root: runtime_root.into(),
            layer_store: layer_store.into(),
            store: MetadataStore::open(metadata_path)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The containerd state directory.  Not consulted by the current
    /// operations; kept for the content and snapshot listings.
    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    fn check_cancelled(cancel: &CancelToken) -> Result<(), ExplorerError> {
        if cancel.is_cancelled() {
            Err(ExplorerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Namespaces recorded in the metadata database.
    pub fn list_namespaces(&self, cancel: &CancelToken) -> Result<Vec<String>, ExplorerError> {
        Self::check_cancelled(cancel)?;
        Ok(self.store.list_namespaces()?)
    }

    /// All containers with a parseable configuration, in identifier
    /// order.
    pub fn list_containers(
        &self,
        cancel: &CancelToken,
    ) -> Result<Vec<ContainerRecord>, ExplorerError> {
        Ok(Catalog::new(&self.root, &self.layer_store).list_containers(cancel)?)
    }

    /// All (name, digest) image bindings, enriched with creation
    /// timestamps where available.
    pub fn list_images(&self, cancel: &CancelToken) -> Result<Vec<ImageRecord>, ExplorerError> {
        Ok(Catalog::new(&self.root, &self.layer_store).list_images(cancel)?)
    }

    /// The ordered overlay layer chain for one container.
    pub fn resolve_layers(&self, container_id: &str) -> Result<LayerChain, ExplorerError> {
        Ok(resolve_layers(&self.root, container_id)?)
    }

    /// Resolve and mount one container's filesystem read-only at
    /// `target`.  The mount belongs to the caller until it unmounts it
    /// through the same engine.
    pub fn mount_container<F: MountFacility>(
        &self,
        engine: &MountEngine<F>,
        container_id: &str,
        target: &Path,
    ) -> Result<(), ExplorerError> {
        let chain = self.resolve_layers(container_id)?;
        Ok(engine.mount(&chain, target)?)
    }

    /// Content-blob listing; not implemented for this runtime layout.
    pub fn list_content(&self) -> Result<Vec<String>, ExplorerError> {
        Err(ExplorerError::Unsupported("content listing"))
    }

    /// Snapshot listing; not implemented for this runtime layout.
    pub fn list_snapshots(&self) -> Result<Vec<String>, ExplorerError> {
        Err(ExplorerError::Unsupported("snapshot listing"))
    }

    /// Full container introspection; not implemented.
    pub fn container_info(&self, _container_id: &str) -> Result<ContainerRecord, ExplorerError> {
        Err(ExplorerError::Unsupported("container introspection"))
    }

    /// Bulk mounting; not implemented.
    pub fn mount_all_containers(&self, _target: &Path) -> Result<(), ExplorerError> {
        Err(ExplorerError::Unsupported("mounting all containers"))
    }

    /// Release the metadata store handle.  Subsequent store operations
    /// fail with [`StoreError::Closed`].  Idempotent.
    pub fn close(&mut self) {
        self.store.close();
    }
}

impl Drop for Explorer {
    fn drop(&mut self) {
        self.close();
    }
}
