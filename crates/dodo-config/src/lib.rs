//! Directory layout and host identity for dodo
//!
//! Everything that depends on where dodo keeps its files lives here, so the
//! stage implementations can receive plain paths instead of reading globals.
//!
//! ```text
//! ~/.dodo/                      (or $DODO_HOME)
//! ├── cache/boot2docker.iso
//! └── stages/<name>/
//!     ├── id_rsa, id_rsa.pub
//!     ├── disk.vmdk, boot2docker.iso
//!     ├── ca.pem, client.pem, client-key.pem
//!     └── state.json
//! ```

pub mod error;
pub mod platform;

pub use error::*;
pub use platform::Platform;

use std::path::{Path, PathBuf};

/// Environment variable overriding the application directory
pub const HOME_ENV: &str = "DODO_HOME";

/// Name of the per-directory configuration folder
pub const CONFIG_DIR_NAME: &str = ".dodo";

/// Resolve the application directory (`$DODO_HOME` or `~/.dodo`)
pub fn app_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Directory holding all stage storage directories
pub fn stages_dir(app_dir: &Path) -> PathBuf {
    app_dir.join("stages")
}

/// Storage directory of a single stage
pub fn stage_dir(app_dir: &Path, name: &str) -> Result<PathBuf> {
    validate_stage_name(name)?;
    Ok(stages_dir(app_dir).join(name))
}

/// Directory for downloaded artifacts shared between stages
pub fn cache_dir(app_dir: &Path) -> PathBuf {
    app_dir.join("cache")
}

/// Create a directory (and parents) if it does not exist yet
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        tracing::debug!(path = %path.display(), "Created directory");
    }
    Ok(())
}

fn validate_stage_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidStageName(name.to_string()))
    }
}

/// Ordered list of configuration directories
///
/// Search order:
/// 1. the working directory and each of its ancestors
/// 2. the home directory
/// 3. `$XDG_CONFIG_HOME` (or the platform config dir)
/// 4. every entry of `$XDG_CONFIG_DIRS`
///
/// Duplicates are dropped, keeping the first occurrence.
pub fn config_search_dirs(working_dir: &Path) -> Vec<PathBuf> {
    let mut dirs_found: Vec<PathBuf> = working_dir.ancestors().map(Path::to_path_buf).collect();

    if let Some(home) = dirs::home_dir() {
        dirs_found.push(home);
    }

    match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg) if !xdg.is_empty() => dirs_found.push(PathBuf::from(xdg)),
        _ => {
            if let Some(config) = dirs::config_dir() {
                dirs_found.push(config);
            }
        }
    }

    if let Ok(xdg_dirs) = std::env::var("XDG_CONFIG_DIRS") {
        dirs_found.extend(
            xdg_dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        );
    }

    let mut unique = Vec::with_capacity(dirs_found.len());
    for dir in dirs_found {
        if !unique.contains(&dir) {
            unique.push(dir);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_app_dir_env_override() {
        let temp_dir = tempfile::tempdir().unwrap();

        unsafe {
            std::env::set_var(HOME_ENV, temp_dir.path());
        }

        let dir = app_dir().unwrap();
        assert_eq!(dir, temp_dir.path());

        unsafe {
            std::env::remove_var(HOME_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_app_dir_default() {
        unsafe {
            std::env::remove_var(HOME_ENV);
        }

        if let Ok(dir) = app_dir() {
            assert!(dir.ends_with(".dodo"));
        }
    }

    #[test]
    fn test_stage_dir_layout() {
        let root = PathBuf::from("/tmp/dodo");
        let dir = stage_dir(&root, "dev").unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/dodo/stages/dev"));
    }

    #[test]
    fn test_stage_dir_rejects_traversal() {
        let root = PathBuf::from("/tmp/dodo");
        assert!(matches!(
            stage_dir(&root, "../etc"),
            Err(ConfigError::InvalidStageName(_))
        ));
        assert!(stage_dir(&root, "..").is_err());
        assert!(stage_dir(&root, "").is_err());
    }

    #[test]
    #[serial]
    fn test_config_search_dirs_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        unsafe {
            std::env::set_var("XDG_CONFIG_DIRS", "/etc/xdg-one:/etc/xdg-two");
        }

        let dirs_found = config_search_dirs(&nested);
        assert_eq!(dirs_found[0], nested);
        assert_eq!(dirs_found[1], temp_dir.path().join("a"));
        assert_eq!(dirs_found[2], temp_dir.path());

        let one = dirs_found
            .iter()
            .position(|d| d == Path::new("/etc/xdg-one"))
            .unwrap();
        let two = dirs_found
            .iter()
            .position(|d| d == Path::new("/etc/xdg-two"))
            .unwrap();
        assert!(one < two);

        unsafe {
            std::env::remove_var("XDG_CONFIG_DIRS");
        }
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("stages").join("dev");
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
        ensure_dir(&target).unwrap();
    }
}
