//! # Execution Module
//!
//! Everything between a line arriving on a socket and a handler running on
//! the host main thread: wire types, admission, the deterministic command
//! queue, per-connection response outboxes, the dispatcher, and the server
//! that ties them together.

pub mod admission;
pub mod command;
mod connection;
pub mod dispatcher;
pub mod queue;
pub mod response_queue;
pub mod server;

pub use admission::AdmissionRejection;
pub use command::{ClientId, Command, CommandKind, Payload, ProtocolError, Response};
pub use dispatcher::{
    typed_handler, CommandDispatcher, CommandExecutor, CommandHandler, DispatchCounters,
    DispatchOutcome, DispatchRecord, HandlerError, OutcomeClass, TypedHandler,
};
pub use queue::{DeterministicCommandQueue, EnqueueReceipt, QueueEntry, QueueKey};
pub use response_queue::ResponseDeliveryQueue;
pub use server::{BridgeServer, BridgeStats};
