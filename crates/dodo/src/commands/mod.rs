pub mod plugin;
pub mod stage;
