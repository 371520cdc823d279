//! HTTP API server.

pub mod auth;
mod error;
mod server;

pub use auth::ApiToken;
pub use error::{ApiError, ApiResult};
pub use server::{ApiState, HttpServer, HttpServerHandle, router};
