//! Read-only overlay mounting of a resolved layer chain.
//!
//! The host's mount facility is an external collaborator reached
//! through the [`MountFacility`] trait, so tests can substitute a
//! double and the error classification stays a small, testable mapping
//! instead of string checks scattered through call sites.

use std::{io, path::Path, process::Command};

use log::debug;
use thiserror::Error;

use crate::layers::LayerChain;

/// mount(8) exit status for a bad mount point or option, which in
/// practice means a mistyped or missing lowerdir entry.
const EXIT_INVALID_LOWERDIR: i32 = 32;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("invalid lowerdir path; enable debug logging to see the resolved layer paths")]
    InvalidLowerPath,
    #[error("mount facility failed: {0}")]
    Failed(String),
    #[error("invoking mount facility")]
    Facility(#[from] io::Error),
}

/// Result of one mount-facility invocation: the process exit code (None
/// if killed by a signal) and its combined stdout/stderr text.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub code: Option<i32>,
    pub output: String,
}

/// The host's mount facility, or a test double standing in for it.
pub trait MountFacility {
    fn invoke(&self, program: &str, args: &[&str]) -> io::Result<Invocation>;
}

/// Shells out to the real `mount`/`umount` binaries.
#[derive(Debug, Default)]
pub struct HostMount;

impl MountFacility for HostMount {
    fn invoke(&self, program: &str, args: &[&str]) -> io::Result<Invocation> {
        let out = Command::new(program).args(args).output()?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(Invocation {
            code: out.status.code(),
            output,
        })
    }
}

/// Explicit exit-status mapping for the mount invocation.
fn classify_mount(invocation: &Invocation) -> Result<(), MountError> {
    match invocation.code {
        Some(0) => Ok(()),
        Some(EXIT_INVALID_LOWERDIR) => Err(MountError::InvalidLowerPath),
        _ => Err(MountError::Failed(invocation.output.trim().to_string())),
    }
}

/// Builds overlay mount options from a [`LayerChain`] and drives the
/// mount facility.  The engine does not track outstanding mounts; each
/// mount belongs to the caller until explicitly unmounted.
#[derive(Debug, Default)]
pub struct MountEngine<F: MountFacility = HostMount> {
    facility: F,
}

impl MountEngine<HostMount> {
    pub fn new() -> MountEngine<HostMount> {
        MountEngine { facility: HostMount }
    }
}

impl<F: MountFacility> MountEngine<F> {
    pub fn with_facility(facility: F) -> MountEngine<F> {
        MountEngine { facility }
    }

    /// The `lowerdir` option value: every lower layer in chain order,
    /// then the upper layer.  The mount is read-only, so the upper
    /// layer is just the highest-precedence read source and is never
    /// opened for writing.
    fn lowerdir(chain: &LayerChain) -> String {
        let mut dirs: Vec<&str> = chain
            .lower
            .iter()
            .map(|p| p.to_str().unwrap_or_default())
            .collect();
        dirs.push(chain.upper.to_str().unwrap_or_default());
        dirs.join(":")
    }

    /// Mount `chain` read-only at `target`.
    pub fn mount(&self, chain: &LayerChain, target: &Path) -> Result<(), MountError> {
        let options = format!("ro,lowerdir={}", Self::lowerdir(chain));
        debug!("mount options {options}");

        let target = target.to_str().unwrap_or_default();
        let args = ["-t", "overlay", "overlay", "-o", options.as_str(), target];
        let invocation = self.facility.invoke("mount", &args)?;
        if !invocation.output.is_empty() {
            debug!("mount output: {}", invocation.output.trim());
        }
        classify_mount(&invocation)
    }

    /// Unmount `target`.  Unmounting something that is not mounted is
    /// treated as success so that cleanup can be retried safely.
    pub fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let target = target.to_str().unwrap_or_default();
        let invocation = self.facility.invoke("umount", &[target])?;
        match invocation.code {
            Some(0) => Ok(()),
            _ if invocation.output.contains("not mounted") => {
                debug!("unmount {target}: already unmounted");
                Ok(())
            }
            _ => Err(MountError::Failed(invocation.output.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, path::PathBuf};

    use super::*;

    /// Records invocations and replays scripted results.
    struct FakeFacility {
        calls: RefCell<Vec<(String, Vec<String>)>>,
        results: RefCell<Vec<Invocation>>,
    }

    impl FakeFacility {
        fn new(results: Vec<Invocation>) -> FakeFacility {
            FakeFacility {
                calls: RefCell::new(Vec::new()),
                results: RefCell::new(results),
            }
        }

        fn ok() -> Invocation {
            Invocation {
                code: Some(0),
                output: String::new(),
            }
        }
    }

    impl MountFacility for FakeFacility {
        fn invoke(&self, program: &str, args: &[&str]) -> io::Result<Invocation> {
            self.calls.borrow_mut().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(self.results.borrow_mut().remove(0))
        }
    }

    fn chain() -> LayerChain {
        LayerChain {
            lower: vec![
                PathBuf::from("/d/overlay2/l/AAA"),
                PathBuf::from("/d/overlay2/l/BBB"),
            ],
            upper: PathBuf::from("/d/overlay2/m1/diff"),
            work: PathBuf::from("/d/overlay2/m1/work"),
        }
    }

    #[test]
    fn mount_builds_overlay_arguments() {
        let facility = FakeFacility::new(vec![FakeFacility::ok()]);
        let engine = MountEngine::with_facility(facility);
        engine.mount(&chain(), Path::new("/mnt/c1")).unwrap();

        let calls = engine.facility.calls.borrow();
        let (program, args) = &calls[0];
        assert_eq!(program, "mount");
        assert_eq!(
            args.as_slice(),
            [
                "-t",
                "overlay",
                "overlay",
                "-o",
                "ro,lowerdir=/d/overlay2/l/AAA:/d/overlay2/l/BBB:/d/overlay2/m1/diff",
                "/mnt/c1",
            ]
        );
    }

    #[test]
    fn empty_lower_chain_mounts_upper_only() {
        let facility = FakeFacility::new(vec![FakeFacility::ok()]);
        let engine = MountEngine::with_facility(facility);
        let chain = LayerChain {
            lower: Vec::new(),
            upper: PathBuf::from("/d/overlay2/m2/diff"),
            work: PathBuf::from("/d/overlay2/m2/work"),
        };
        engine.mount(&chain, Path::new("/mnt/c2")).unwrap();

        let calls = engine.facility.calls.borrow();
        assert_eq!(calls[0].1[4], "ro,lowerdir=/d/overlay2/m2/diff");
    }

    #[test]
    fn exit_32_maps_to_invalid_lower_path() {
        let facility = FakeFacility::new(vec![Invocation {
            code: Some(32),
            output: "mount: /mnt/c1: special device overlay does not exist.".to_string(),
        }]);
        let engine = MountEngine::with_facility(facility);
        let err = engine.mount(&chain(), Path::new("/mnt/c1")).unwrap_err();
        assert!(matches!(err, MountError::InvalidLowerPath));
    }

    #[test]
    fn other_failures_carry_facility_output() {
        let facility = FakeFacility::new(vec![Invocation {
            code: Some(1),
            output: "mount: only root can do that\n".to_string(),
        }]);
        let engine = MountEngine::with_facility(facility);
        match engine.mount(&chain(), Path::new("/mnt/c1")).unwrap_err() {
            MountError::Failed(text) => assert_eq!(text, "mount: only root can do that"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn unmount_is_idempotent() {
        let facility = FakeFacility::new(vec![
            FakeFacility::ok(),
            Invocation {
                code: Some(32),
                output: "umount: /mnt/c1: not mounted.".to_string(),
            },
        ]);
        let engine = MountEngine::with_facility(facility);
        engine.unmount(Path::new("/mnt/c1")).unwrap();
        // second unmount of the same target still succeeds
        engine.unmount(Path::new("/mnt/c1")).unwrap();

        let calls = engine.facility.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "umount");
        assert_eq!(calls[0].1, ["/mnt/c1"]);
    }
}
