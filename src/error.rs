use thiserror::Error;

/// Failure to hand a batch to the collector.
///
/// Batches that fail are logged and dropped, never retried.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("error sending batch: {0}")]
    Transport(#[from] attohttpc::Error),
    #[error("collector responded with status {0}")]
    Status(u16),
    #[error("couldn't encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}
