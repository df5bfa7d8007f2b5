//! bq-guard: a guarded BigQuery console.
//!
//! Every query is estimated with a dry run, reviewed against policy, and
//! approved by typing a confirmation phrase before it may execute. The
//! approval is bound to the exact query text and is spent by one execution.

pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod guard;
pub mod logging;
pub mod metadata;
pub mod persistence;
pub mod policy;
pub mod tui;
pub mod warehouse;
