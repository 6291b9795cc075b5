//! Protocol and scheduling limits.

/// Size and count limits enforced by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_key_size: usize,
    pub max_version_size: usize,
    pub max_value_size: usize,
    /// Largest encoded response the sink will carry.
    pub max_message_size: usize,
    /// Accumulated member size at which a batch commit is refused.
    pub max_batch_size: usize,
    pub max_deletes_per_batch: usize,
    /// Open batches across all connections.
    pub max_batches: usize,
    /// Retained responses one connection may hold before a flush is forced.
    pub max_pending_status: usize,
}

impl Limits {
    pub const DEFAULT_MAX_KEY_SIZE: usize = 1024;
    pub const DEFAULT_MAX_VERSION_SIZE: usize = 2048;
    pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 64 * 1024 * 1024;
    pub const DEFAULT_MAX_DELETES_PER_BATCH: usize = 24_000;
    pub const DEFAULT_MAX_BATCHES: usize = 10_000;
    pub const DEFAULT_MAX_PENDING_STATUS: usize = 976;
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key_size: Self::DEFAULT_MAX_KEY_SIZE,
            max_version_size: Self::DEFAULT_MAX_VERSION_SIZE,
            max_value_size: Self::DEFAULT_MAX_VALUE_SIZE,
            max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
            max_deletes_per_batch: Self::DEFAULT_MAX_DELETES_PER_BATCH,
            max_batches: Self::DEFAULT_MAX_BATCHES,
            max_pending_status: Self::DEFAULT_MAX_PENDING_STATUS,
        }
    }
}
