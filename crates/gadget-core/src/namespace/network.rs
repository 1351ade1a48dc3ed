//! Network namespace entry.
//!
//! `setns(2)` only changes the namespace of the calling thread. Each switch
//! therefore happens on a short-lived scoped thread that exits once the work
//! is done, so the caller's thread never leaves the host namespace.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use gadget_common::error::{GadgetError, Result};

use super::NamespaceEntry;

/// Enters container network namespaces through `/proc/<pid>/ns/net`.
///
/// Switches are serialized: only one namespace worker runs at a time per
/// instance.
#[derive(Debug)]
pub struct NetnsEnter {
    proc_root: PathBuf,
    lock: Mutex<()>,
}

impl NetnsEnter {
    /// Creates an entry primitive reading namespaces from `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    /// Creates an entry primitive with a custom procfs mount point.
    #[must_use]
    pub const fn with_proc_root(proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            lock: Mutex::new(()),
        }
    }

    fn open_namespace(&self, pid: u32) -> Result<File> {
        let path = self.proc_root.join(pid.to_string()).join("ns").join("net");
        File::open(&path).map_err(|e| open_error(pid, path, e))
    }
}

fn open_error(pid: u32, path: PathBuf, e: std::io::Error) -> GadgetError {
    if e.kind() == std::io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) {
        return GadgetError::NotFound {
            kind: "network namespace",
            id: pid.to_string(),
        };
    }
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return GadgetError::PermissionDenied {
            message: format!("opening {}: {e}", path.display()),
        };
    }
    GadgetError::Io { path, source: e }
}

impl Default for NetnsEnter {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceEntry for NetnsEnter {
    fn run(&self, pid: u32, f: &(dyn Fn() -> Result<()> + Sync)) -> Result<()> {
        if pid == 0 {
            return f();
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ns = self.open_namespace(pid)?;

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    join_network_namespace(&ns, pid)?;
                    tracing::trace!(pid, "entered network namespace");
                    f()
                })
                .join()
                .unwrap_or_else(|_| {
                    Err(GadgetError::Namespace {
                        pid,
                        message: "namespace worker panicked".into(),
                    })
                })
        })
    }
}

#[cfg(target_os = "linux")]
fn join_network_namespace(ns: &File, pid: u32) -> Result<()> {
    use nix::sched::{CloneFlags, setns};

    setns(ns, CloneFlags::CLONE_NEWNET).map_err(|e| setns_error(pid, e))
}

#[cfg(target_os = "linux")]
fn setns_error(pid: u32, errno: nix::errno::Errno) -> GadgetError {
    use nix::errno::Errno;

    match errno {
        Errno::EPERM => GadgetError::PermissionDenied {
            message: format!("setns into network namespace of pid {pid} requires CAP_SYS_ADMIN"),
        },
        _ => GadgetError::Namespace {
            pid,
            message: format!("setns failed: {errno}"),
        },
    }
}

#[cfg(not(target_os = "linux"))]
fn join_network_namespace(_ns: &File, pid: u32) -> Result<()> {
    Err(GadgetError::Namespace {
        pid,
        message: "Linux required to enter network namespaces".into(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn host_pid_runs_in_place() {
        let calls = AtomicUsize::new(0);
        let caller = std::thread::current().id();
        NetnsEnter::new()
            .run(0, &|| {
                assert_eq!(std::thread::current().id(), caller);
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("host run should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn host_pid_propagates_closure_error() {
        let err = NetnsEnter::new()
            .run(0, &|| {
                Err(GadgetError::Config {
                    message: "boom".into(),
                })
            })
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn vanished_process_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let entry = NetnsEnter::with_proc_root(dir.path().to_path_buf());
        let err = entry.run(4242, &|| Ok(())).unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[test]
    fn open_errors_are_classified() {
        let path = PathBuf::from("/proc/7/ns/net");
        let err = open_error(7, path.clone(), std::io::Error::from_raw_os_error(libc::ESRCH));
        assert!(err.is_not_found());

        let err = open_error(7, path.clone(), std::io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(err, GadgetError::PermissionDenied { .. }), "unexpected error: {err}");
        assert!(err.to_string().contains("/proc/7/ns/net"));

        let err = open_error(7, path, std::io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(err, GadgetError::Io { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn setns_eperm_is_permission_denied() {
        use nix::errno::Errno;

        let err = setns_error(7, Errno::EPERM);
        assert!(matches!(err, GadgetError::PermissionDenied { .. }), "unexpected error: {err}");
        assert!(err.to_string().starts_with("permission denied"));

        let err = setns_error(7, Errno::EINVAL);
        assert!(matches!(err, GadgetError::Namespace { pid: 7, .. }));
    }
}
