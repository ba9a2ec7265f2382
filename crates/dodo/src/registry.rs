//! Stage selection
//!
//! Built-in types map to in-process implementations; any other type is looked
//! up as a plugin executable.

use dodo_plugin::{PluginStage, find_plugin};
use dodo_stage::{EnvironmentStage, GenericStage, HostEnv, Stage, StageError};
use dodo_stage_virtualbox::VirtualBoxStage;
use std::path::Path;

pub const BUILTIN_TYPES: [&str; 3] = [
    dodo_stage::builtin::environment::STAGE_TYPE,
    dodo_stage::builtin::generic::STAGE_TYPE,
    dodo_stage_virtualbox::STAGE_TYPE,
];

/// In-process implementation of `stage_type`, if there is one
pub fn builtin(stage_type: &str, env: &HostEnv) -> Option<Box<dyn Stage>> {
    match stage_type {
        dodo_stage::builtin::environment::STAGE_TYPE => Some(Box::new(EnvironmentStage::new())),
        dodo_stage::builtin::generic::STAGE_TYPE => Some(Box::new(GenericStage::new())),
        dodo_stage_virtualbox::STAGE_TYPE => Some(Box::new(VirtualBoxStage::new(env.clone()))),
        _ => None,
    }
}

/// Resolve `stage_type` to a built-in or a launched plugin
pub async fn resolve(
    stage_type: &str,
    env: &HostEnv,
    working_dir: &Path,
) -> Result<Box<dyn Stage>, StageError> {
    if let Some(stage) = builtin(stage_type, env) {
        tracing::debug!(stage_type, "Using built-in stage");
        return Ok(stage);
    }

    let dirs = dodo_config::config_search_dirs(working_dir);
    let path = find_plugin(stage_type, &env.platform, &dirs)?;
    let stage = PluginStage::spawn(stage_type, &path).await?;
    Ok(Box::new(stage))
}
