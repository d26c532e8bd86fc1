//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Transfers allowed to start per second (0 = no throttle)
    pub transfer_throttle: usize,
    /// Chunk I/O operations per second (0 = no throttle)
    pub chunk_iops_throttle: usize,
    /// Bytes per I/O operation when accounting chunk tokens
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using chunk_iops_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Settings shared by every transfer of a job
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Size of the byte ranges transfers are split into (0 = one chunk per object)
    pub chunk_size: u64,
    /// Workers executing chunks, shared by all transfers of the process
    pub pool_size: usize,
    /// Transfers grouped into one job part
    pub transfers_per_part: u32,
    /// Transfers allowed between scheduling and completion at the same time
    pub max_active_transfers: usize,
    /// Reconnects a single chunk read may make before failing
    pub max_retry_count: usize,
    /// Fail a chunk instead of reconnecting when its stalled read is forcibly closed
    pub treat_early_close_as_error: bool,
    /// Force a reconnect when a chunk read makes no progress for this long
    pub stall_timeout: Option<std::time::Duration>,
    pub overwrite: crate::overwrite::OverwritePolicy,
    /// Carry the source modification time over to the destination
    pub preserve_mtime: bool,
    /// Use the platform whole-file copy for local to local transfers
    pub fast_copy: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 << 20,
            pool_size: 32,
            transfers_per_part: 10_000,
            max_active_transfers: 1024,
            max_retry_count: 5,
            treat_early_close_as_error: false,
            stall_timeout: None,
            overwrite: crate::overwrite::OverwritePolicy::Always,
            preserve_mtime: false,
            fast_copy: true,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".to_string());
        }
        if self.transfers_per_part == 0 {
            return Err("transfers_per_part must be at least 1".to_string());
        }
        if self.max_active_transfers == 0 {
            return Err("max_active_transfers must be at least 1".to_string());
        }
        if self.stall_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("stall_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}
