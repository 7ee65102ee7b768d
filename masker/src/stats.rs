//! Result record of one masking run.

use serde::{Deserialize, Serialize};

/// Counters and health of a completed [`apply`](crate::PayloadMasker::apply)
/// run. Non-fatal problems accumulate in `errors`; fatal ones abort the run
/// and never produce stats.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct MaskingStats {
    pub packets_processed: u64,
    /// Packets whose payload bytes changed.
    pub packets_modified: u64,
    pub masked_bytes: u64,
    pub preserved_bytes: u64,
    /// Packets written through unchanged because they could not be parsed.
    pub pass_through_errors: u64,
    pub duration_ms: u64,
    pub peak_memory_bytes: u64,
    pub errors: Vec<String>,
    /// Outcome of the post-run output check (packet count and file size).
    pub validation_passed: bool,
}
