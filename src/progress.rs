//! Progress & error taxonomy (C7, spec §7): normalizes per-engine state
//! reports into one event vocabulary, and the `MissingParent` report row
//! (explicitly "a non-fatal event, not an error type").

use log::info;

/// A record whose lookup parent could not be resolved at write time (spec
/// §4.4). Non-fatal: the field is written as null and this row is
/// appended to the run's report.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingParent {
    pub child_object: String,
    pub child_field: String,
    pub external_id: String,
    pub parent_object: String,
    pub parent_external_id_field: String,
}

/// Which side of a retrieval pass an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSide {
    Source,
    Target,
}

/// The common progress event vocabulary, shared across the retrieval
/// driver and all three API engines (spec §4.3, §4.5).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Retrieval: every N records received.
    RowsReceived { object: String, side: RetrievalSide, rows_so_far: usize },
    OperationStarted { object: String },
    Open { object: String },
    UploadStart { object: String },
    UploadComplete { object: String },
    InProgress { object: String, processed: usize, failed: usize },
    JobComplete { object: String },
    OperationFinished { object: String, succeeded: usize, failed: usize },
    FailedOrAborted { object: String, detail: String },
}

/// A sink progress events are delivered to. A caller who does not wire one
/// still gets a usable run log via [`ConsoleProgressSink`], the ambient
/// default.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Wire up `env_logger` as the `log` backend, so a caller that never
/// configures its own logging still sees the `debug!`/`info!`/`warn!`
/// lines this crate emits at every suspension point (spec §5) and
/// progress event (spec §7). Idempotent: a second call after logging is
/// already initialized (by this or another crate) is a harmless no-op.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// Log-backed default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgressSink;

impl ProgressSink for ConsoleProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RowsReceived { object, side, rows_so_far } => {
                info!("{object} [{side:?}]: {rows_so_far} rows received");
            }
            ProgressEvent::OperationStarted { object } => info!("{object}: operation started"),
            ProgressEvent::Open { object } => info!("{object}: open"),
            ProgressEvent::UploadStart { object } => info!("{object}: upload start"),
            ProgressEvent::UploadComplete { object } => info!("{object}: upload complete"),
            ProgressEvent::InProgress { object, processed, failed } => {
                info!("{object}: in progress ({processed} processed, {failed} failed)");
            }
            ProgressEvent::JobComplete { object } => info!("{object}: job complete"),
            ProgressEvent::OperationFinished { object, succeeded, failed } => {
                info!("{object}: finished ({succeeded} succeeded, {failed} failed)");
            }
            ProgressEvent::FailedOrAborted { object, detail } => {
                log::warn!("{object}: failed or aborted — {detail}");
            }
        }
    }
}
