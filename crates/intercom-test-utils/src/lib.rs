//! # Intercom Test Utilities
//!
//! Shared test utilities for the intercom service.
//!
//! ## Modules
//!
//! - `mock_endpoint` - Scripted intercom endpoint on a loopback TCP port
//!
//! ## Usage
//!
//! ```rust,ignore
//! use intercom_test_utils::{AnswerMode, MockEndpoint};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let endpoint = MockEndpoint::builder().mode(AnswerMode::Ring).start().await;
//!
//!     // Point a connection at endpoint.host() / endpoint.port() ...
//!
//!     let start = endpoint.wait_for_frame(MessageType::Start).await;
//!     assert!(!start.flags.no_ring);
//! }
//! ```

pub mod mock_endpoint;

pub use mock_endpoint::{AnswerMode, MockEndpoint, MockEndpointBuilder};
