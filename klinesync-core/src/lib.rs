//! klinesync core: A-share daily kline types, provider adapters, validation,
//! incremental merge and backed-up parquet storage.
//!
//! - Domain types (symbols, bar records, fetch windows, trading calendar)
//! - Providers: a TDX binary socket client, a session gateway and the
//!   Eastmoney HTTP API, tried in order through a composite fetcher
//! - Retry, rate limiting and circuit breaking around every request
//! - Validation, merge with last-wins dedup, and storage with rotating backups

pub mod config;
pub mod data;
pub mod domain;
