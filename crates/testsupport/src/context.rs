//! Isolated trail contexts over temporary directories.

use crate::fixtures::RecordingMachine;
use common::{Options, TrailResult};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use trail::AuditTrail;

/// A trail plus its recording machine, backed by a temporary directory that
/// is cleaned up on drop.
pub struct TrailContext {
    dir: TempDir,
    pub machine: Arc<RecordingMachine>,
    pub trail: AuditTrail,
}

impl TrailContext {
    /// Open a fresh trail with the given options.
    pub async fn new(options: Options) -> TrailResult<Self> {
        Self::with_dir(tempfile::tempdir()?, options).await
    }

    /// Open a trail over an existing directory, with a fresh machine. Used
    /// for restart tests: drop the previous context's trail first.
    pub async fn with_dir(dir: TempDir, options: Options) -> TrailResult<Self> {
        let machine = RecordingMachine::new();
        let trail = AuditTrail::open(dir.path(), options, machine.clone()).await?;
        Ok(Self {
            dir,
            machine,
            trail,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Simulate a restart: reopen the same directory with a fresh machine.
    pub async fn restart(self, options: Options) -> TrailResult<Self> {
        let Self { dir, trail, .. } = self;
        drop(trail);
        Self::with_dir(dir, options).await
    }
}
