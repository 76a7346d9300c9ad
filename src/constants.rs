//! Custom property keys shared by the workflows and the resource registry.

/// Set to `"true"` on compute descriptions and computes that become
/// container hosts once provisioned.
pub const ENABLE_CONTAINER_HOST_KEY: &str = "__enableContainerHost";

/// Endpoint a compute description belongs to.
pub const ENDPOINT_LINK_KEY: &str = "__endpointLink";

/// Resource pool of a group placement or a compute host.
pub const RESOURCE_POOL_LINK_KEY: &str = "__resourcePoolLink";

/// Remaining capacity of a group placement.
pub const AVAILABLE_INSTANCES_KEY: &str = "__availableInstances";

/// Host a composite component was placed on.
pub const HOST_LINK_KEY: &str = "__hostLink";

/// Set on a compute once it is registered as a container host.
pub const CONTAINER_HOST_REGISTERED_KEY: &str = "__containerHostRegistered";

/// Address reported by the adapter for a provisioned compute.
pub const ADDRESS_KEY: &str = "__address";

/// Name of the adapter that answered a request.
pub const ADAPTER_KEY: &str = "__adapter";

/// Default attempts when validating a new host connection.
pub const HOST_CONNECTION_RETRY_ATTEMPTS: u32 = 10;

/// Default delay between host connection validation attempts.
pub const HOST_CONNECTION_RETRY_DELAY_MS: u64 = 10_000;
