use crate::PluginCommands;
use crate::registry;
use anyhow::Context;
use colored::Colorize;
use dodo_stage::HostEnv;

pub async fn handle(cmd: PluginCommands) -> anyhow::Result<()> {
    match cmd {
        PluginCommands::Serve { stage_type } => {
            let env = HostEnv::from_process().context("failed to resolve the dodo directory")?;
            let mut stage = registry::builtin(&stage_type, &env).ok_or_else(|| {
                anyhow::anyhow!(
                    "'{}' is not a built-in stage type (built-in: {})",
                    stage_type,
                    registry::BUILTIN_TYPES.join(", ")
                )
            })?;
            dodo_plugin::serve(&stage_type, stage.as_mut()).await?;
        }
        PluginCommands::Path { stage_type } => {
            let platform = dodo_config::Platform::current();
            let dirs = dodo_config::config_search_dirs(&std::env::current_dir()?);
            match dodo_plugin::find_plugin(&stage_type, &platform, &dirs) {
                Ok(path) => println!("{}", path.display()),
                Err(dodo_plugin::PluginError::NotFound { searched, .. }) => {
                    eprintln!(
                        "{} no plugin for stage type '{}'. Searched:",
                        "Error:".red().bold(),
                        stage_type
                    );
                    for path in &searched {
                        eprintln!("  {}", path.display());
                    }
                    anyhow::bail!("plugin not found");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
