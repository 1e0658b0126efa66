//! Notesync Gateway - real-time WebSocket sync for notebook clients
//!
//! This crate keeps every client viewing a note in step with the notebook
//! backend: it authenticates frames, routes client operations to the backend
//! services, and fans the results back out to the right connections.

mod angular;
mod connection;
mod dispatcher;
mod error;
mod events;
mod fanout;
mod gateway;
mod pool;
mod protocol;
mod registry;
mod services;
mod session;

pub use angular::AngularBridge;
pub use connection::{ConnectionError, ConnectionHandle, ConnectionState};
pub use dispatcher::{Dispatcher, JOB_MANAGER_PAGE};
pub use error::{DispatchError, GatewayError, Result};
pub use events::{BackendEvent, BackendEvents};
pub use fanout::Fanout;
pub use gateway::Gateway;
pub use pool::TaskPool;
pub use protocol::{InboundMessage, Op, OutboundMessage, WatcherMessage};
pub use registry::{ConnectionRegistry, Removal};
pub use services::Services;
pub use session::{AuthResult, SessionGate, TicketEntry, TicketStore, WATCHER_KEY_HEADER};
