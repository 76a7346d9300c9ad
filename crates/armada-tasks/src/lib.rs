//! Durable task orchestration for the Armada control plane.
//!
//! A *task* is a persisted workflow instance that advances through an
//! ordered set of named sub-stages by merging update messages into itself.
//! Each accepted update may invoke the workflow's handler, which performs
//! remote work and reports back with the next update. Tasks compose only
//! through parent links: a child resolves its link and sends exactly one
//! update to its parent when it ends.
//!
//! # Overview
//!
//! - Updates for one task are serialized through a per-address mailbox;
//!   different tasks run concurrently.
//! - Records are written with compare-and-swap, so the store may be shared
//!   by concurrent writers.
//! - Duplicate, late and out-of-order updates are dropped by the
//!   transition rules instead of corrupting state.
//! - Parent notifications are marked pending in the same write that makes
//!   a task terminal and are redelivered after a restart.
//!
//! # Module Organization
//!
//! - [`types`] - stages, sub-stages, addresses, links, updates and failures
//! - [`domain`] - the task record and its merge rules
//! - [`store`] - storage backends and the typed task store
//! - [`engine`] - transition rules, mailboxes and the [`Workflow`](engine::Workflow) trait
//! - [`callback`] - parent notification
//! - [`fanout`] - in-process fan-out/fan-in
//! - [`retry`] - bounded retry of remote calls
//! - [`compensator`] - correlated cleanup
//! - [`counter`] - durable fan-in over child tasks
//! - [`config`] - engine settings
//! - [`error`] - error types
//! - [`constants`] - property keys and defaults

pub mod callback;
pub mod compensator;
pub mod config;
pub mod constants;
pub mod counter;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod retry;
pub mod store;
pub mod types;

pub use constants::*;
pub use error::TaskError;
pub use types::{
    DefaultSubStage, FailureDetail, FailureKind, StageTarget, SubStage, TaskAddress, TaskLink,
    TaskStage, TaskUpdate,
};
