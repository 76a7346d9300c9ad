//! Armada control plane: provisioning workflows on durable tasks.
//!
//! The workflows in this crate run on the [`armada_tasks`] engine. Each one
//! is a persisted task that walks its sub-stages, calls provisioning
//! backends through [`adapter::Adapter`] handles and records what it
//! created in the [`registry::ResourceRegistry`].
//!
//! # Workflows
//!
//! | Kind                                | Purpose                                   |
//! |-------------------------------------|-------------------------------------------|
//! | `container-host-provisioning`       | Allocate and provision container hosts    |
//! | `kubernetes-composite-provisioning` | Reserve, place and apply a composite      |
//! | `composite-removal`                 | Remove composite components in type order |
//! | `artifact-pipeline`                 | Resolve sources, compile and publish      |
//!
//! Helper workflows (`compute-allocation`, `compute-provision`,
//! `compute-instance-provision`, `reservation`,
//! `placement-host-selection`, `counter`) are started as children.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use armada::config::ControlPlaneConfig;
//! use armada::control_plane::ControlPlane;
//! use armada::workflows::{Adapters, CompositeRemoval};
//! use armada::workflows::removal::RemovalBody;
//! use armada_tasks::domain::TaskRequest;
//! use armada_tasks::TaskStage;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let plane = ControlPlane::from_config(ControlPlaneConfig::default(), Adapters::scripted())
//!     .await
//!     .unwrap();
//! let address = plane
//!     .engine()
//!     .start::<CompositeRemoval>(TaskRequest::new(RemovalBody::default()))
//!     .await
//!     .unwrap();
//! let header = plane
//!     .engine()
//!     .await_terminal(&address, Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! assert_eq!(header.stage, TaskStage::Finished);
//! # });
//! ```

pub mod adapter;
pub mod config;
pub mod constants;
pub mod control_plane;
pub mod error;
pub mod logging;
pub mod registry;
pub mod workflows;

pub use config::ControlPlaneConfig;
pub use control_plane::ControlPlane;
pub use error::{AdapterError, ConfigError, ControlPlaneError, RegistryError};
pub use logging::init_logging;
pub use registry::{ResourceRegistry, ResourceState, ResourceType};
