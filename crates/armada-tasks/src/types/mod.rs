//! Wire-level types shared by every workflow.
//!
//! - [`stage`] - coarse lifecycle stage
//! - [`sub_stage`] - workflow-specific sub-stage trait and defaults
//! - [`link`] - task addresses and parent callbacks
//! - [`update`] - the update message
//! - [`failure`] - failure payloads

pub mod failure;
pub mod link;
pub mod stage;
pub mod sub_stage;
pub mod update;

pub use failure::{FailureDetail, FailureKind};
pub use link::{TaskAddress, TaskLink};
pub use stage::TaskStage;
pub use sub_stage::{DefaultSubStage, StageTarget, SubStage};
pub use update::TaskUpdate;
