//! HTTP API for the verification gateway.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check (no API key)
//! - `GET /quota` - Credit balance of the caller
//! - `GET /upstream/status` - Probe the upstream service
//! - `POST /redeem` - Redeem a code for credits
//! - `POST /verify` - Submit a verification task
//! - `GET /verify/status/{task_id}` - Task status and result
//! - `POST /verify/batch` - Verify a list of ids synchronously
//! - `POST /cancel` - Cancel work for a verification id
//! - `POST /admin/codes` - Mint redemption codes (admin token)

mod auth;
mod error;
mod routes;
pub mod types;

pub use auth::{Credential, ADMIN_TOKEN_HEADER, API_KEY_HEADER};
pub use error::{ApiError, ErrorKind};
pub use routes::{build_router, serve, AppState};
pub use types::*;
