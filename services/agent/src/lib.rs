//! dt Agent Library
//!
//! The agent runs on each test host and supervises exactly one managed
//! process (the instance) on behalf of a remote controller. It starts, stops,
//! restarts, pauses and resumes the instance, backs up or erases its working
//! directory, injects port faults, and registers its own address with the
//! controller.
//!
//! ## Architecture
//!
//! ```text
//! Control endpoint (api)
//! └── Agent
//!     ├── InstanceController   (state machine, one mutex)
//!     │   └── CommandExecutor  (spawn / signal / wait, log sink)
//!     ├── PortFaultProvider    (dt-netfault)
//!     └── Registrar            (controller registration)
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod exec;
pub mod instance;
pub mod logging;
pub mod registrar;

// Re-export commonly used types
pub use agent::Agent;
pub use config::Config;
pub use error::AgentError;
pub use instance::{InstanceController, InstanceState, InstanceStatus};
