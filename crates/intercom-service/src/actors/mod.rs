//! Session model for the intercom service.
//!
//! ```text
//! SessionRegistry (one per process)
//! ├── CallSession (one per device in a call with the hub)
//! │   └── EndpointConnection
//! └── BridgeSession (one per source/dest pair)
//!     ├── EndpointConnection (source)
//!     └── EndpointConnection (dest)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Typed events**: a connection reports everything on one `mpsc` channel
//!   of [`EndpointEvent`]s; its session consumes them in a single task
//! - **Queues plus dedicated senders**: audio is pushed into bounded
//!   drop-newest queues and forwarded by one long-lived task per direction
//! - **CancellationToken shutdown**: teardown cancels tokens and joins tasks
//!   with a grace period instead of spawning detached stop tasks
//!
//! # Modules
//!
//! - [`endpoint`] - `EndpointConnection`, one TCP socket to one endpoint
//! - [`call`] - `CallSession`, endpoint to hub audio relay
//! - [`bridge`] - `BridgeSession`, endpoint to endpoint relay
//! - [`registry`] - `SessionRegistry`, at most one session per identifier
//! - [`queue`] - `AudioQueue`, bounded drop-newest queue
//! - [`messages`] - events, states and notifications

pub mod bridge;
pub mod call;
pub mod endpoint;
pub mod messages;
pub mod queue;
pub mod registry;

pub use bridge::{BridgeSession, EndpointSpec};
pub use call::{CallSession, SessionSettings};
pub use endpoint::{ConnectionSettings, EndpointConnection};
pub use messages::*;
pub use queue::AudioQueue;
pub use registry::{BridgeRequest, BridgeSummary, RegistrySnapshot, SessionRegistry, SessionSummary};

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Wait for a task to finish, aborting it if the grace period runs out.
pub(crate) async fn join_with_grace(task: JoinHandle<()>, grace: Duration, task_name: &'static str) {
    let abort = task.abort_handle();
    if tokio::time::timeout(grace, task).await.is_err() {
        warn!(
            target: "intercom.actors",
            task = task_name,
            grace_ms = grace.as_millis(),
            "Task did not stop within grace period, aborting"
        );
        abort.abort();
    }
}
