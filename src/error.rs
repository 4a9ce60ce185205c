/// Errors surfaced by the cold-path dump entry points.
///
/// The hot path (start/stop/pulse) never returns errors; everything that
/// can fail here is a property of the byte sink the report is written to.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
