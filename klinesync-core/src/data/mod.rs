//! Providers, fallback, validation, merge and storage

pub mod cancel;
pub mod circuit_breaker;
pub mod composite;
pub mod eastmoney;
pub mod frame;
pub mod http;
pub mod merge;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod storage;
pub mod tdx;
pub mod validate;

pub use cancel::CancelToken;
pub use circuit_breaker::CircuitBreaker;
pub use composite::{CompositeFetch, CompositeFetcher, ProviderFailure};
pub use eastmoney::EastmoneyProvider;
pub use merge::{merge, merge_or_spool, MergeError, MergeFailure};
pub use provider::{
    BarProvider, ErrorCategory, ErrorClassification, Outcome, ProviderError,
    ProviderStatsSnapshot,
};
pub use rate_limit::RequestLimiter;
pub use retry::{RetryError, RetryPolicy};
pub use session::SessionProvider;
pub use storage::{BackupEntry, DatasetSummary, SaveReport, StorageError, StorageGateway};
pub use tdx::TdxProvider;
pub use validate::{validate, ValidationReport};
