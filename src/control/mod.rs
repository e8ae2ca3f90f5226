//! Orchestration of entity mutations and remote reconciliation

mod download;
mod fleet;
mod queue;

pub use download::{ConfigDownload, DownloadService, CONFIG_CONTENT_TYPE};
pub use fleet::{Fleet, ImportSummary, Reconciled};
pub use queue::{with_retry, ReconcileQueue, ServerStats};
