//! Built-in stages that need no provisioning

pub mod environment;
pub mod generic;

pub use environment::EnvironmentStage;
pub use generic::GenericStage;
