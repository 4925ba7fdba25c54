use serde::{Deserialize, Serialize};
use tracing::warn;

use ks_core::{Chunk, KernelProfile, Tension, aggregate, tension::valid_pair};

use crate::error::{Result, StoreError};
use crate::store::{KernelRecord, KernelStatus, Store};

pub const EXPORT_VERSION: u32 = 1;

/// Self-contained snapshot of one kernel. The graph is not included; it is
/// recomputed from the tensions on import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelExport {
    pub version: u32,
    pub kernel: KernelProfile,
    pub chunks: Vec<Chunk>,
    pub tensions: Vec<Tension>,
}

impl Store {
    pub fn export_kernel(&self, kernel_id: &str) -> Result<KernelExport> {
        let record = self.require_kernel(kernel_id)?;
        Ok(KernelExport {
            version: EXPORT_VERSION,
            kernel: record.profile,
            chunks: self.get_chunks(kernel_id, usize::MAX)?,
            tensions: self.all_tensions(kernel_id)?,
        })
    }

    /// Import a snapshot under its original kernel id. Fails if that id is taken.
    pub fn import_kernel(&self, export: KernelExport) -> Result<KernelRecord> {
        if export.version != EXPORT_VERSION {
            return Err(StoreError::InvalidData(format!(
                "unsupported export version {} (expected {EXPORT_VERSION})",
                export.version
            )));
        }
        let kernel_id = export.kernel.id.clone();
        let tensions: Vec<Tension> = export
            .tensions
            .into_iter()
            .filter(|t| {
                let ok = valid_pair(&t.pole_a, &t.pole_b);
                if !ok {
                    warn!(id = %t.id, "dropping imported tension with invalid poles");
                }
                ok
            })
            .map(Tension::normalized)
            .collect();

        let status = if export.chunks.is_empty() && tensions.is_empty() {
            KernelStatus::Empty
        } else {
            KernelStatus::Ready
        };
        self.insert_kernel(&export.kernel, status)?;
        let saved = self
            .save_chunks(&kernel_id, &export.chunks)
            .and_then(|_| self.save_tensions(&kernel_id, &tensions))
            .and_then(|_| self.replace_graph(&kernel_id, &aggregate(&tensions)));
        if let Err(e) = saved {
            // leave nothing half-imported
            self.delete_kernel(&kernel_id)?;
            return Err(e);
        }
        self.require_kernel(&kernel_id)
    }
}
