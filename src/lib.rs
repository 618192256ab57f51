//! Offline forensic reconstruction of Docker container state.
//!
//! This crate reads the on-disk artifacts a Docker daemon leaves behind
//! (per-container JSON configuration, the containerd metadata database,
//! and the overlay2 layer store) and rebuilds an inventory of containers,
//! images and their filesystems without the daemon running.  All access
//! is strictly read-only: the expected input is a quiesced copy or an
//! acquired disk image.

pub mod boltdb;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod explorer;
pub mod layers;
pub mod mount;

pub use cancel::CancelToken;
pub use explorer::{Explorer, ExplorerError};
