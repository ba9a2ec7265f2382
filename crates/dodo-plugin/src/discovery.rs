//! Plugin executable discovery
//!
//! A plugin for stage type `hyperv` on 64-bit Linux is the file
//! `<config-dir>/.dodo/plugins/plugin-hyperv_linux_amd64`. Config dirs are
//! searched in [`dodo_config::config_search_dirs`] order; the first regular,
//! executable file wins.

use crate::error::{PluginError, Result};
use dodo_config::{CONFIG_DIR_NAME, Platform};
use std::path::{Path, PathBuf};

pub const PLUGINS_DIR: &str = "plugins";

/// File name of the plugin for `stage_type` on `platform`
pub fn plugin_file_name(stage_type: &str, platform: &Platform) -> String {
    let name = format!("plugin-{}_{}", stage_type, platform);
    if platform.is_windows() {
        format!("{}.exe", name)
    } else {
        name
    }
}

/// Every candidate path, in search order
pub fn candidate_paths(stage_type: &str, platform: &Platform, config_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let file_name = plugin_file_name(stage_type, platform);
    config_dirs
        .iter()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(PLUGINS_DIR).join(&file_name))
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Find the plugin executable for `stage_type`
pub fn find_plugin(stage_type: &str, platform: &Platform, config_dirs: &[PathBuf]) -> Result<PathBuf> {
    let candidates = candidate_paths(stage_type, platform, config_dirs);

    for candidate in &candidates {
        if is_executable(candidate) {
            tracing::debug!(stage_type, path = %candidate.display(), "Found plugin");
            return Ok(candidate.clone());
        }
        if candidate.exists() {
            tracing::warn!(path = %candidate.display(), "Ignoring plugin that is not an executable file");
        }
    }

    Err(PluginError::NotFound {
        stage_type: stage_type.to_string(),
        searched: candidates,
    })
}
