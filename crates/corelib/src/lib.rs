//! Core library for the node communication layer.
//!
//! This crate provides the building blocks every other crate runs on:
//! - Node identities and the error taxonomy
//! - Request/response envelopes, metadata and result codes
//! - Configuration and logging bootstrap
//! - The shared worker pool with delayed/periodic scheduling
//! - Ordered asynchronous callback delivery
//! - The explicit per-process context tying these together

pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod message;
pub mod node;
pub mod pool;

pub use callback::{AsyncOrderedCallbackManager, CallbackExceptionPolicy};
pub use config::CommConfig;
pub use context::CommContext;
pub use error::{Error, Result};
pub use message::{MessageMetadata, NetworkRequest, NetworkResponse, ResultCode};
pub use node::{NodeId, NodeIdentity};
pub use pool::{TaskHandle, WorkerPool};
