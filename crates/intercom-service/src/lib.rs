//! Intercom Service Library
//!
//! Relays 16 kHz mono PCM audio between networked intercom endpoints and
//! the hub:
//!
//! - Call sessions: one endpoint talks to the hub
//! - Bridges: two endpoints talk to each other through the hub
//! - Notifications: state changes and received audio for outside consumers
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> actors::SessionRegistry
//!                                   -> CallSession / BridgeSession
//!                                   -> EndpointConnection (TCP)
//! ```
//!
//! # Modules
//!
//! - `actors` - Connections, sessions and the registry
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - HTTP metrics middleware
//! - `notify` - Broadcast notification sink
//! - `observability` - Metrics and health probes
//! - `routes` - Axum router setup

pub mod actors;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod notify;
pub mod observability;
pub mod routes;
