//! Batched progress reporting for pulls, pushes, and exports.

use std::sync::Arc;

/// One unit of progress accounting.
///
/// `AddTotal*` events accumulate expected work as it is discovered; the
/// non-total pair reports completed work. Both directions are commutative,
/// so handlers may batch and reorder freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressEvent {
    /// Completed items (blobs, manifests).
    AddItems(u64),
    /// Newly discovered expected items.
    AddTotalItems(u64),
    /// Completed bytes.
    AddSize(u64),
    /// Newly discovered expected bytes.
    AddTotalSize(u64),
}

/// A non-throwing callback invoked with batches of progress events.
pub type ProgressHandler = Arc<dyn Fn(&[ProgressEvent]) + Send + Sync>;

/// Delivers a batch of events if a handler is installed.
pub fn emit(handler: Option<&ProgressHandler>, events: &[ProgressEvent]) {
    if let Some(handler) = handler {
        handler(events);
    }
}
