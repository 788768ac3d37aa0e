//! # verigate
//!
//! Credit-metered gateway in front of an external verification service.
//!
//! This library provides:
//! - HTTP APIs for verification tasks, batches, cancellation, and credits
//! - An async task engine that drives each verification to a terminal state
//! - A credit ledger that charges exactly once per successful verification
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API ──► TaskEngine ──► UpstreamClient ──► verification service
//!      │             │   ▲
//!      │             ▼   │
//!      │        CreditLedger   CancellationRegistry
//!      ▼
//!   BatchCoordinator (bounded fan-out over the engine)
//! ```
//!
//! ## Task Flow
//! 1. Reserve one credit and store a `pending` task
//! 2. Ask the upstream, polling while it awaits confirmation
//! 3. Capture the credit on success, release it otherwise
//! 4. Keep the terminal view for the retention window
//!
//! ## Modules
//! - `tasks`: task engine, store, batch coordinator, cancellation
//! - `ledger`: credit balances and holds
//! - `upstream`: client for the verification service
//! - `redeem`: single-use redemption codes

pub mod api;
pub mod config;
pub mod ledger;
pub mod redeem;
pub mod tasks;
pub mod upstream;
pub mod util;

pub use config::Config;
