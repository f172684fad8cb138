use crate::SourceId;

/// User-facing notification emitted by [`SourceManager`](super::SourceManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    /// New download source was added.
    Added,

    /// Download source was removed.
    Removed { id: SourceId },

    /// Download source could not be removed.
    RemoveFailed { id: SourceId, reason: String },

    /// All download sources were synchronized.
    Synced(SyncSummary),

    /// Synchronization failed, no source was updated.
    SyncFailed { reason: String },
}

/// Result of synchronization of all download sources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Sources which are up to date now.
    pub up_to_date: usize,

    /// Sources which failed to synchronize.
    pub errored: usize,

    /// Updates for sources which disappeared during synchronization.
    pub skipped: usize,
}
