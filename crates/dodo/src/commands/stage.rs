use crate::registry;
use crate::{StageArgs, StageCommands};
use anyhow::Context;
use colored::Colorize;
use dodo_stage::{HostEnv, RemoveOptions, Stage, StageConfig};

/// Parse repeated `-o KEY=VALUE` flags into a stage config
pub fn stage_config(args: &StageArgs) -> anyhow::Result<StageConfig> {
    let mut config = StageConfig::new(&args.stage_type);
    for option in &args.options {
        let (key, value) = option
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("option '{}' is not KEY=VALUE", option))?;
        config = config.with_option(key.trim(), value);
    }
    Ok(config)
}

async fn open(args: &StageArgs) -> anyhow::Result<Box<dyn Stage>> {
    let config = stage_config(args)?;
    let env = HostEnv::from_process().context("failed to resolve the dodo directory")?;
    let working_dir = std::env::current_dir()?;

    let mut stage = registry::resolve(&args.stage_type, &env, &working_dir).await?;
    initialize(stage.as_mut(), &args.name, &config).await?;
    Ok(stage)
}

/// Initialize `stage`, releasing it when that fails
async fn initialize(stage: &mut dyn Stage, name: &str, config: &StageConfig) -> anyhow::Result<()> {
    if let Err(e) = stage.initialize(name, config).await {
        if let Err(cleanup) = stage.cleanup().await {
            tracing::warn!(error = %cleanup, "Stage cleanup failed");
        }
        return Err(e.into());
    }
    Ok(())
}

pub async fn handle(cmd: StageCommands) -> anyhow::Result<()> {
    let args = match &cmd {
        StageCommands::Create(args)
        | StageCommands::Start(args)
        | StageCommands::Stop(args)
        | StageCommands::Status(args)
        | StageCommands::Env(args)
        | StageCommands::Ssh(args) => args.clone(),
        StageCommands::Remove { stage, .. } => stage.clone(),
    };

    let mut stage = open(&args).await?;
    let result = run(cmd, &args, stage.as_mut()).await;

    // The plugin process goes away whatever happened
    if let Err(e) = stage.cleanup().await {
        tracing::warn!(error = %e, "Stage cleanup failed");
    }
    result
}

async fn run(cmd: StageCommands, args: &StageArgs, stage: &mut dyn Stage) -> anyhow::Result<()> {
    let name = &args.name;

    match cmd {
        StageCommands::Create(_) => {
            eprintln!("{}", format!("Creating stage '{}' ({})...", name, args.stage_type).blue().bold());
            stage.create().await?;
            eprintln!("{}", format!("✓ Stage '{}' is running", name).green().bold());
        }
        StageCommands::Start(_) => {
            eprintln!("{}", format!("Starting stage '{}'...", name).blue().bold());
            stage.start().await?;
            eprintln!("{}", format!("✓ Stage '{}' is running", name).green().bold());
        }
        StageCommands::Stop(_) => {
            eprintln!("{}", format!("Stopping stage '{}'...", name).yellow().bold());
            stage.stop().await?;
            eprintln!("{}", format!("✓ Stage '{}' stopped", name).green().bold());
        }
        StageCommands::Remove { force, volumes, .. } => {
            eprintln!("{}", format!("Removing stage '{}'...", name).red().bold());
            stage.remove(RemoveOptions { force, volumes }).await?;
            eprintln!("{}", format!("✓ Stage '{}' removed", name).green().bold());
        }
        StageCommands::Status(_) => {
            let exists = stage.exist().await?;
            let available = exists && stage.available().await?;
            let status = match (exists, available) {
                (false, _) => "nonexistent".dimmed(),
                (true, false) => "unavailable".yellow(),
                (true, true) => "available".green(),
            };
            println!("{} {} ({})", name.cyan().bold(), status, args.stage_type);
        }
        StageCommands::Env(_) => {
            let docker = stage.docker_options().await?;
            for (key, value) in docker.to_env() {
                println!("export {}=\"{}\"", key, value);
            }
        }
        StageCommands::Ssh(_) => {
            let ssh = stage.ssh_options().await?;
            println!("Host:         {}", ssh.hostname);
            println!("Port:         {}", ssh.port);
            println!("User:         {}", ssh.username);
            println!("IdentityFile: {}", ssh.private_key_file);
        }
    }

    Ok(())
}
