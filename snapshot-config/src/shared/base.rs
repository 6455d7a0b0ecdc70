use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,

    #[error("`snapshot.endpoint` cannot be empty")]
    EmptyEndpoint,

    #[error("`snapshot.tables` must list at least one table unless `mode` is `never`")]
    NoTables,

    /// Two entries of `snapshot.tables` name the same table, e.g. `orders` and `public.orders`.
    #[error("`snapshot.tables` lists `{0}` more than once")]
    DuplicateTable(String),

    #[error("`snapshot.chunk_size` must be greater than zero")]
    ChunkSizeZero,

    #[error("`snapshot.max_chunk_workers` cannot be zero")]
    MaxChunkWorkersZero,

    #[error("`snapshot.max_chunk_attempts` cannot be zero")]
    MaxChunkAttemptsZero,

    #[error("`snapshot.max_job_attempts` cannot be zero")]
    MaxJobAttemptsZero,

    /// A heartbeat interval at or above the claim timeout lets live claims go stale.
    #[error(
        "`snapshot.heartbeat_interval_ms` ({heartbeat_interval_ms}) must be lower than `snapshot.claim_timeout_ms` ({claim_timeout_ms})"
    )]
    HeartbeatNotBelowClaimTimeout {
        heartbeat_interval_ms: u64,
        claim_timeout_ms: u64,
    },

    #[error("Invalid retry config: {0}")]
    InvalidRetry(&'static str),
}
