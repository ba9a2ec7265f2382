//! dodo stages
//!
//! A stage is an execution environment able to host a container daemon. This
//! crate defines the [`Stage`] interface shared by every implementation, the
//! data types exchanged with callers, and the plumbing the implementations
//! build on.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   dodo CLI                       │
//! │          (dodo stage create/start/...)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │ Box<dyn Stage>
//! ┌─────────────────▼───────────────────────────────┐
//! │                 dodo-stage                       │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │   trait Stage { create, start, ... }     │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────┐  ┌───────────┐  ┌────────────┐   │
//! │  │ HostEnv  │  │   Poll    │  │ State/Lock │   │
//! │  └──────────┘  └───────────┘  └────────────┘   │
//! └───────┬─────────────────┬───────────────┬───────┘
//!         │                 │               │
//! ┌───────▼───────┐ ┌───────▼───────┐ ┌─────▼──────┐
//! │   built-ins   │ │  virtualbox   │ │  plugins   │
//! │ env / generic │ │      VM       │ │ (process)  │
//! └───────────────┘ └───────────────┘ └────────────┘
//! ```

pub mod builtin;
pub mod error;
pub mod host;
pub mod poll;
pub mod stage;
pub mod state;
pub mod types;

// Re-exports
pub use builtin::{EnvironmentStage, GenericStage};
pub use error::{Result, StageError};
pub use host::{HostEnv, PipedChild, SystemRunner, ToolOutput, ToolRunner};
pub use poll::{Check, Poll, PollTimeout};
pub use stage::Stage;
pub use state::{StageLock, StageState, StateManager};
pub use types::{DockerOptions, RemoveOptions, SshOptions, StageConfig, StageStatus};
