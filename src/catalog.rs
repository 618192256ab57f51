//! Inventory assembly from the on-disk directory layout.
//!
//! The catalog walks the container and image roots, drives the config
//! parsers over every entry and applies the per-entry failure policy: a
//! missing file degrades gracefully (the entry is skipped with a
//! warning), a malformed file aborts the listing, because malformed
//! configuration on an acquired image points at a corrupted or
//! truncated acquisition that must not be silently under-reported.

use std::{fs, io, path::{Path, PathBuf}};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    cancel::CancelToken,
    config::{
        parse_container_config, parse_image_content, parse_repository_index, ContainerRecord,
        Digest, ImageRecord, SchemaError, CONFIG_V1_FILENAME, CONFIG_V2_FILENAME,
    },
};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("configuration for {id}")]
    Schema {
        id: String,
        #[source]
        source: SchemaError,
    },
    #[error("image repository root {} not found", .path.display())]
    RepositoryUnavailable { path: PathBuf },
    #[error("reading {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("listing cancelled")]
    Cancelled,
}

impl CatalogError {
    fn io(path: &Path, source: io::Error) -> CatalogError {
        CatalogError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Enumerates containers and images under one Docker root directory.
pub struct Catalog<'a> {
    root: &'a Path,
    /// The layered-filesystem driver namespace image enrichment applies
    /// to, e.g. "overlay2".
    layer_store: &'a str,
}

impl<'a> Catalog<'a> {
    pub fn new(root: &'a Path, layer_store: &'a str) -> Catalog<'a> {
        Catalog { root, layer_store }
    }

    /// Candidate container ids: one subdirectory per container, the
    /// directory name being the identifier.  Sorted for stable output.
    fn container_ids(&self, containers_dir: &Path) -> Result<Vec<String>, CatalogError> {
        let entries =
            fs::read_dir(containers_dir).map_err(|e| CatalogError::io(containers_dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::io(containers_dir, e))?;
            if entry
                .file_type()
                .map_err(|e| CatalogError::io(&entry.path(), e))?
                .is_dir()
            {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// All containers with a parseable configuration.
    ///
    /// A candidate with only a legacy v1 config, or with no config file
    /// at all, is skipped with a warning: a partial inventory beats
    /// aborting the whole listing.  The newer schema strictly takes
    /// precedence when both generations exist.  Cancellation discards
    /// everything collected so far.
    pub fn list_containers(
        &self,
        cancel: &CancelToken,
    ) -> Result<Vec<ContainerRecord>, CatalogError> {
        let containers_dir = self.root.join("containers");
        let mut records = Vec::new();

        for id in self.container_ids(&containers_dir)? {
            if cancel.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }
            let container_dir = containers_dir.join(&id);

            let v2_path = container_dir.join(CONFIG_V2_FILENAME);
            if v2_path.exists() {
                let data = fs::read(&v2_path).map_err(|e| CatalogError::io(&v2_path, e))?;
                let record = parse_container_config(&data)
                    .map_err(|source| CatalogError::Schema { id: id.clone(), source })?;
                records.push(record);
                continue;
            }

            if container_dir.join(CONFIG_V1_FILENAME).exists() {
                warn!("container {id}: legacy v1 configuration is not supported, skipping");
                continue;
            }

            warn!("container {id}: no configuration file found, skipping");
        }

        Ok(records)
    }

    /// One [`ImageRecord`] per (name, digest) pair in the repository
    /// indexes, enriched with a creation timestamp where the content
    /// summary can be loaded.
    pub fn list_images(&self, cancel: &CancelToken) -> Result<Vec<ImageRecord>, CatalogError> {
        let repositories_dir = self.root.join("image");
        if !repositories_dir.exists() {
            return Err(CatalogError::RepositoryUnavailable {
                path: repositories_dir,
            });
        }

        let mut storage_dirs: Vec<PathBuf> = fs::read_dir(&repositories_dir)
            .map_err(|e| CatalogError::io(&repositories_dir, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        storage_dirs.sort();

        let mut records = Vec::new();

        for storage_dir in storage_dirs {
            let storage_name = storage_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let index_path = storage_dir.join("repositories.json");
            debug!(
                "image repository index {} for storage {storage_name}",
                index_path.display()
            );

            let data = fs::read(&index_path).map_err(|e| CatalogError::io(&index_path, e))?;
            let index = parse_repository_index(&data).map_err(|source| CatalogError::Schema {
                id: storage_name.clone(),
                source,
            })?;

            for bindings in index.repositories.values() {
                for (name, digest) in bindings {
                    if cancel.is_cancelled() {
                        return Err(CatalogError::Cancelled);
                    }
                    let digest: Digest =
                        digest.parse().map_err(|source| CatalogError::Schema {
                            id: name.clone(),
                            source,
                        })?;

                    let created_at = if storage_name == self.layer_store {
                        self.image_created_at(&storage_dir, name, &digest)
                    } else {
                        None
                    };

                    records.push(ImageRecord {
                        name: name.clone(),
                        digest,
                        created_at,
                    });
                }
            }
        }

        Ok(records)
    }

    /// Enrichment step: the creation timestamp from the image's content
    /// summary.  Never fatal; a missing or unreadable summary just
    /// leaves the record without a timestamp.
    fn image_created_at(
        &self,
        storage_dir: &Path,
        name: &str,
        digest: &Digest,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let content_path = storage_dir
            .join("imagedb")
            .join("content")
            .join(&digest.algorithm)
            .join(&digest.encoded);
        let data = match fs::read(&content_path) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    "image {name}: cannot read content summary {}: {err}",
                    content_path.display()
                );
                return None;
            }
        };
        match parse_image_content(&data) {
            Ok(summary) => Some(summary.created),
            Err(err) => {
                warn!("image {name}: malformed content summary: {err}");
                None
            }
        }
    }
}
