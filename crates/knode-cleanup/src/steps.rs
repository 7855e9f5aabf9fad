//! The uninstall step framework.
//!
//! An uninstall flow is a fixed sequence of named steps. Every step runs
//! even if an earlier one failed; failures are logged as they happen and
//! summarized at the end. External concerns (stopping the container
//! runtime, removing system services) plug in as additional
//! [`CleanupStep`] implementations.

use std::path::PathBuf;

use knode_common::{KnodeError, KnodePaths, KnodeResult};

use crate::teardown::cleanup_beneath;

/// A single named unit of uninstall work.
pub trait CleanupStep {
    /// The human-readable name of the step, used in log output.
    fn name(&self) -> &str;

    /// Run the step to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the step could not complete; the runner
    /// continues with the remaining steps regardless.
    fn run(&self) -> KnodeResult<()>;
}

/// Configuration for an uninstall run.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// The data directory to erase (default: /var/lib/knode).
    pub data_dir: PathBuf,
    /// The runtime directory to erase (default: /run/knode).
    pub run_dir: PathBuf,
}

impl CleanupConfig {
    /// Build a configuration from resolved paths.
    #[must_use]
    pub fn new(paths: &KnodePaths) -> Self {
        Self {
            data_dir: paths.data.clone(),
            run_dir: paths.run.clone(),
        }
    }
}

/// Runs a sequence of [`CleanupStep`]s in order.
pub struct Cleanup {
    steps: Vec<Box<dyn CleanupStep>>,
}

impl Cleanup {
    /// Assemble the standard uninstall sequence for `config`.
    #[must_use]
    pub fn new(config: &CleanupConfig) -> Self {
        Self {
            steps: vec![Box::new(DirectoriesStep::new(config))],
        }
    }

    /// Assemble an uninstall run from an explicit list of steps.
    #[must_use]
    pub fn with_steps(steps: Vec<Box<dyn CleanupStep>>) -> Self {
        Self { steps }
    }

    /// Run every step, in order. Failures do not stop later steps.
    ///
    /// # Errors
    ///
    /// Returns an error summarizing how many steps failed, if any did.
    pub fn run(&self) -> KnodeResult<()> {
        let total = self.steps.len();
        let mut failed = 0_usize;

        for step in &self.steps {
            tracing::info!(step = step.name(), "Running cleanup step");
            if let Err(err) = step.run() {
                failed += 1;
                tracing::error!(step = step.name(), error = %err, "Cleanup step failed");
            }
        }

        if failed > 0 {
            return Err(KnodeError::Internal {
                message: format!("{failed} of {total} cleanup steps failed"),
            });
        }
        Ok(())
    }
}

/// Removes the Knode-owned directories.
pub struct DirectoriesStep {
    data_dir: PathBuf,
    run_dir: PathBuf,
}

impl DirectoriesStep {
    /// Create the step for the directories named in `config`.
    #[must_use]
    pub fn new(config: &CleanupConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            run_dir: config.run_dir.clone(),
        }
    }
}

impl CleanupStep for DirectoriesStep {
    fn name(&self) -> &str {
        "remove directories step"
    }

    fn run(&self) -> KnodeResult<()> {
        // The run directory goes first: it holds sockets and pipes of the
        // stopped service, never mounts of interest.
        let mut failures = Vec::new();
        for dir in [&self.run_dir, &self.data_dir] {
            if let Err(err) = cleanup_beneath(dir) {
                tracing::error!(
                    path = %dir.display(),
                    error = %err,
                    "Failed to delete directory"
                );
                failures.push(format!("failed to delete {}: {err}", dir.display()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KnodeError::Cleanup {
                message: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStep;

    impl CleanupStep for FailingStep {
        fn name(&self) -> &str {
            "failing step"
        }

        fn run(&self) -> KnodeResult<()> {
            Err(KnodeError::Config {
                message: "boom".to_string(),
            })
        }
    }

    #[test]
    fn directories_step_removes_both_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(data_dir.join("manifests")).unwrap();
        std::fs::write(data_dir.join("manifests/app.yaml"), b"kind: Test").unwrap();
        std::fs::create_dir(&run_dir).unwrap();
        std::fs::write(run_dir.join("knode.pid"), b"1234").unwrap();

        let config = CleanupConfig {
            data_dir: data_dir.clone(),
            run_dir: run_dir.clone(),
        };
        Cleanup::new(&config).run().unwrap();

        assert!(!data_dir.exists());
        assert!(!run_dir.exists());
    }

    #[test]
    fn directories_step_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CleanupConfig {
            data_dir: tmp.path().join("data"),
            run_dir: tmp.path().join("run"),
        };

        let cleanup = Cleanup::new(&config);
        cleanup.run().unwrap();
        cleanup.run().unwrap();
    }

    #[test]
    fn directories_step_reports_every_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file in place of each parent makes both removals fail.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let config = CleanupConfig {
            data_dir: blocker.join("data"),
            run_dir: blocker.join("run"),
        };
        let err = DirectoriesStep::new(&config).run().unwrap_err();

        let message = err.to_string();
        assert!(message.contains("blocker/run"), "{message}");
        assert!(message.contains("blocker/data"), "{message}");
    }

    #[test]
    fn failing_steps_are_counted_not_fatal() {
        let cleanup = Cleanup::with_steps(vec![Box::new(FailingStep), Box::new(FailingStep)]);
        let err = cleanup.run().unwrap_err();
        assert!(err.to_string().contains("2 of 2 cleanup steps failed"));
    }
}
