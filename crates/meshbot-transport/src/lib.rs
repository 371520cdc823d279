//! # meshbot transport
//!
//! The network edges around the dispatcher:
//!
//! ```text
//! ┌──────────────┐   JSON frames   ┌────────────┐
//! │ radio bridge │ ◄─────────────► │  RadioHub  │ ──► Dispatcher::submit
//! │  (per node)  │    WebSocket    │ (routing)  │ ◄── RadioTransport::send
//! └──────────────┘                 └────────────┘
//!
//! HTTP client ──► HttpServer (axum) ──► ApiFacade
//! Dispatcher  ──► WebhookForwarder (EventObserver) ──► POST (reqwest)
//! ```
//!
//! ## Features
//!
//! - `http-server` (default): REST API
//! - `webhook` (default): webhook forwarding of inbound text
//! - `radio-ws` (default): WebSocket radio bridge client and hub

#[cfg(feature = "http-server")]
pub mod http;

#[cfg(feature = "radio-ws")]
pub mod radio;

#[cfg(feature = "webhook")]
pub mod webhook;

#[cfg(feature = "http-server")]
pub use http::{ApiError, ApiState, HttpServer, HttpServerHandle};

#[cfg(feature = "radio-ws")]
pub use radio::{BackoffConfig, RadioBridge, RadioHub};

#[cfg(feature = "webhook")]
pub use webhook::WebhookForwarder;
