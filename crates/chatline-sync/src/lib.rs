//! Client-side synchronization of chat conversations over a websocket:
//! the conversation store, the delta merger with its selection gate, the
//! stall watchdog, notifications, and the connection lifecycle.

pub mod api;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod gate;
pub mod merger;
pub mod notify;
pub mod observe;
pub mod stall;
pub mod store;

pub use api::ApiClient;
pub use backoff::Backoff;
pub use config::SyncConfig;
pub use connection::{ConnectionLease, ConnectionManager, ConnectionState};
pub use engine::{EngineEvent, SyncEngine};
pub use error::{ApiError, SyncError};
pub use gate::SelectionGate;
pub use merger::{DeltaMerger, MergeOutcome};
pub use notify::NotificationChannel;
pub use observe::{Observers, Subscription};
pub use stall::StallMonitor;
pub use store::{ApplyOutcome, ConversationStore, StoreEvent};
