//! `--processor-executable` support: spawns one worker process per configured
//! index and reaps them on shutdown.
//!
//! Scoped to one `ItemDistributor` and owned by the `tsb-cli` binary rather
//! than the core, unlike a process-wide child manager that installs its own
//! signal handlers.

use std::process::{Child, Command};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("--processor-executable is empty")]
    EmptyCommand,
    #[error("failed to spawn worker {index}: {source}")]
    Spawn { index: usize, #[source] source: std::io::Error },
}

/// Owns the child processes spawned for one compute node's local worker
/// pool. Each worker is launched from the same template command, with `%s`
/// substituted for the shared-memory application id and `%i` for the
/// worker's index.
pub struct ProcessorPool {
    children: Vec<Child>,
}

impl ProcessorPool {
    /// Spawns `num_workers` processes from `template` (e.g. `"<path> %s
    /// %i"`), one per worker index in `[0, num_workers)`.
    pub fn spawn(template: &str, app_name: &str, num_workers: usize) -> Result<Self, ProcessorError> {
        let mut children = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let substituted = template.replace("%s", app_name).replace("%i", &index.to_string());
            let mut parts = substituted.split_whitespace();
            let program = parts.next().ok_or(ProcessorError::EmptyCommand)?;
            let child = Command::new(program)
                .args(parts)
                .spawn()
                .map_err(|source| ProcessorError::Spawn { index, source })?;
            tracing::info!(index, pid = child.id(), program, "spawned processor instance");
            children.push(child);
        }
        Ok(Self { children })
    }

    /// Removes and returns the exit status of any worker that has already
    /// terminated, so the caller can decide whether that is a fatal
    /// condition for the run.
    pub fn reap_exited(&mut self) -> Vec<(usize, std::process::ExitStatus)> {
        let mut exited = Vec::new();
        let mut i = 0;
        while i < self.children.len() {
            match self.children[i].try_wait() {
                Ok(Some(status)) => {
                    exited.push((i, status));
                    self.children.remove(i);
                }
                Ok(None) => i += 1,
                Err(err) => {
                    tracing::warn!(index = i, %err, "failed to poll worker status");
                    i += 1;
                }
            }
        }
        exited
    }

    /// Sends a kill signal to every still-running worker and waits for them
    /// to exit.
    pub fn shutdown(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.children.clear();
    }
}

impl Drop for ProcessorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_substitutes_shm_id_and_worker_index() {
        // `true` ignores its arguments; this only checks substitution + spawn succeeds.
        let mut pool = ProcessorPool::spawn("true %s %i", "myapp", 2).expect("spawn true");
        std::thread::sleep(std::time::Duration::from_millis(50));
        let exited = pool.reap_exited();
        assert_eq!(exited.len(), 2);
        for (_, status) in exited {
            assert!(status.success());
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = ProcessorPool::spawn("", "app", 1);
        assert!(matches!(err, Err(ProcessorError::EmptyCommand)));
    }
}
