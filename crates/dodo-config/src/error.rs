use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("home directory not found; set DODO_HOME to choose an application directory")]
    HomeDirNotFound,

    #[error("invalid stage name '{0}': only letters, digits, '-', '_' and '.' are allowed")]
    InvalidStageName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
