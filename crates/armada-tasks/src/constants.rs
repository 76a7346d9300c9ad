//! Custom property keys and engine defaults.

/// Custom property holding the correlation (context) id shared by every
/// task and resource created for one top-level request.
pub const CONTEXT_ID_KEY: &str = "__contextId";

/// Custom property naming the task that spawned a resource.
pub const PARENT_TASK_KEY: &str = "__parentTask";

/// Default number of attempts for a retried remote call.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default fixed delay between retried remote calls.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Prefix of the failure message recorded when a task expires.
pub const EXPIRED_MESSAGE_PREFIX: &str = "Task expired in stage";

/// Failure message recorded on a cancelled task's parent.
pub const CANCELLED_MESSAGE: &str = "Task cancelled";
