//! Host OS/architecture identity

use std::fmt;

/// Operating system and architecture of the host, in the naming used for
/// plugin executables (`linux`, `darwin`, `windows` / `amd64`, `arm64`, `386`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running process
    pub fn current() -> Self {
        Self::from_rust(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Translate Rust target names into plugin naming
    pub fn from_rust(os: &str, arch: &str) -> Self {
        let os = match os {
            "macos" => "darwin",
            other => other,
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "arm" => "arm",
            other => other,
        };
        Self::new(os, arch)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rust_names() {
        assert_eq!(
            Platform::from_rust("macos", "aarch64"),
            Platform::new("darwin", "arm64")
        );
        assert_eq!(
            Platform::from_rust("linux", "x86_64"),
            Platform::new("linux", "amd64")
        );
        assert_eq!(Platform::from_rust("windows", "x86").to_string(), "windows_386");
    }
}
