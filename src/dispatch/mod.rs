// src/dispatch/mod.rs

//! Asynchronous task dispatch for external step iterations.
//!
//! The dispatcher accepts a unit of work plus a target host, assigns it a
//! stable content-derived identifier, and tracks its lifecycle:
//!
//! `QUEUED → RUNNING → {SUCCEEDED | FAILED | CANCELLED}`
//!
//! The dispatcher itself never performs the work; it drives a
//! [`RemoteExecutor`] and relays state. It also never retries — retry
//! policy belongs to the step executor.

pub mod dispatcher;
pub mod remote;
pub mod task;

pub use dispatcher::{CancelOutcome, Dispatcher};
pub use remote::{RemoteExecutor, RemoteOutcome, SshRemote};
pub use task::{task_id, TaskFailure, TaskId, TaskRecord, TaskSpec, TaskState};
