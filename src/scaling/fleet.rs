//! Fleet managers: the components that actually start and stop workers.
//!
//! The auto-scaler only decides on a target count. A `FleetManager` moves
//! the fleet towards it. Calls are idempotent, and new workers announce
//! themselves through the worker registry rather than through the return
//! value.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ScalingError;

/// Moves the worker fleet towards a desired size.
#[async_trait]
pub trait FleetManager: Send + Sync {
    async fn set_worker_count(&self, target: usize) -> Result<(), ScalingError>;
}

/// Runs workers as child processes of the current host.
///
/// Each child is `{program} {args..}`, by default the running executable
/// with the `worker` subcommand. Scaling down sends SIGTERM to the most
/// recently started children so they deregister cleanly.
pub struct ProcessFleet {
    program: PathBuf,
    args: Vec<String>,
    children: Mutex<Vec<Child>>,
}

impl ProcessFleet {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `crawlfleet worker` using the current executable.
    pub fn current_exe(extra_args: Vec<String>) -> Result<Self, ScalingError> {
        let program = std::env::current_exe().map_err(|e| ScalingError::Fleet {
            target: 0,
            message: format!("cannot locate current executable: {}", e),
        })?;
        let mut args = vec!["worker".to_string()];
        args.extend(extra_args);
        Ok(Self::new(program, args))
    }

    /// Children still running after reaping exited ones.
    pub fn running(&self) -> usize {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut children);
        children.len()
    }

    fn spawn_one(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
    }
}

#[async_trait]
impl FleetManager for ProcessFleet {
    async fn set_worker_count(&self, target: usize) -> Result<(), ScalingError> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut children);
        let current = children.len();

        if target > current {
            for _ in current..target {
                let child = self.spawn_one().map_err(|e| ScalingError::Fleet {
                    target,
                    message: format!("failed to spawn {}: {}", self.program.display(), e),
                })?;
                debug!(pid = ?child.id(), "Spawned worker process");
                children.push(child);
            }
        } else {
            for mut child in children.drain(target..).rev() {
                terminate(&mut child);
            }
        }

        info!(from = current, to = target, "Worker fleet resized");
        Ok(())
    }
}

impl Drop for ProcessFleet {
    fn drop(&mut self) {
        let children = self.children.get_mut().unwrap_or_else(PoisonError::into_inner);
        for child in children.iter_mut() {
            terminate(child);
        }
    }
}

/// Drops children that have already exited.
fn reap(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            warn!(pid = ?child.id(), %status, "Worker process exited");
            false
        }
        Ok(None) => true,
        Err(e) => {
            warn!(error = %e, "Failed to poll worker process");
            true
        }
    });
}

#[cfg(target_family = "unix")]
fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        let _ = child.start_kill();
        return;
    };
    // SAFETY: kill has no memory-safety preconditions; pid belongs to a
    // child we spawned and have not yet reaped.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(target_family = "unix"))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Fleet manager that only records the requested targets.
///
/// Used by `crawlfleet monitor --dry-run` and in tests.
#[derive(Debug, Default)]
pub struct DryRunFleet {
    requests: Mutex<Vec<usize>>,
}

impl DryRunFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every target requested so far, oldest first.
    pub fn requests(&self) -> Vec<usize> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_target(&self) -> Option<usize> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }
}

#[async_trait]
impl FleetManager for DryRunFleet {
    async fn set_worker_count(&self, target: usize) -> Result<(), ScalingError> {
        info!(target_workers = target, "Dry run: would resize worker fleet");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target);
        Ok(())
    }
}
