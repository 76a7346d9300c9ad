//! Domain types for the stored representation of tasks.
//!
//! - [`TaskRecord`] - typed durable state of one workflow instance
//! - [`TaskHeader`] - workflow-independent view of the same document
//! - [`TaskRequest`] - creation request

pub mod record;

pub use record::{
    overwrite_if_some, NoBody, Notification, TaskBody, TaskHeader, TaskLogLevel, TaskRecord,
    TaskRequest, TaskStatusView,
};
