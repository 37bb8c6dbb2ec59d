#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod handlers;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use registry::{HandlerRegistry, TaskHandler};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerReport, WorkerState};
