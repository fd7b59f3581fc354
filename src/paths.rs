//! Where the config file and logs live.
//!
//! - **Dev mode** (debug builds): `config.yaml` in the working directory wins.
//! - **Portable mode**: a `.portable` marker next to the executable keeps
//!   everything beside it.
//! - **Installed mode** (default): the platform data directory, e.g.
//!   `%APPDATA%\deej-bridge`.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name used in installed mode
const APP_NAME: &str = "deej-bridge";

const CONFIG_FILE: &str = "config.yaml";
const EXAMPLE_CONFIG_FILE: &str = "config.example.yaml";

/// Resolved application paths
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    pub logs_dir: PathBuf,
    pub is_portable: bool,
}

impl AppPaths {
    /// Paths rooted at `base`
    pub fn in_dir(base: &Path, is_portable: bool) -> Self {
        Self {
            config: base.join(CONFIG_FILE),
            logs_dir: base.join("logs"),
            is_portable,
        }
    }

    /// Detect the mode and resolve paths
    ///
    /// Runs before logging is initialised, so diagnostics go to stderr.
    pub fn detect() -> Self {
        let exe_dir = exe_dir();

        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join(CONFIG_FILE).exists() {
                eprintln!("[paths] DEV mode, using {}", cwd.display());
                return Self::in_dir(&cwd, true);
            }
        }

        if exe_dir.join(".portable").exists() {
            #[cfg(debug_assertions)]
            eprintln!("[paths] PORTABLE mode, using {}", exe_dir.display());
            return Self::in_dir(&exe_dir, true);
        }

        let app_data = dirs::data_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] WARNING: no data directory, falling back to exe dir");
                exe_dir.clone()
            })
            .join(APP_NAME);

        #[cfg(debug_assertions)]
        eprintln!("[paths] INSTALLED mode, using {}", app_data.display());

        Self::in_dir(&app_data, false)
    }

    /// Config path to load: the command-line override, else the detected one
    pub fn config_path(&self, override_path: Option<&str>) -> PathBuf {
        override_path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.clone())
    }

    /// Create the logs directory and, in installed mode, seed the config
    /// from the example shipped next to the executable.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if !self.logs_dir.exists() {
            debug!("Creating logs directory: {}", self.logs_dir.display());
            std::fs::create_dir_all(&self.logs_dir).with_context(|| {
                format!("Failed to create logs directory {}", self.logs_dir.display())
            })?;
        }

        if self.is_portable || self.config.exists() {
            return Ok(());
        }

        if let Some(parent) = self.config.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let candidates = [
            exe_dir().join(CONFIG_FILE),
            exe_dir().join(EXAMPLE_CONFIG_FILE),
            PathBuf::from(EXAMPLE_CONFIG_FILE),
        ];
        match candidates.iter().find(|p| p.exists()) {
            Some(source) => {
                info!("Copying {} to {}", source.display(), self.config.display());
                std::fs::copy(source, &self.config).with_context(|| {
                    format!(
                        "Failed to copy config from {} to {}",
                        source.display(),
                        self.config.display()
                    )
                })?;
            }
            None => info!("No config found, please create {}", self.config.display()),
        }

        Ok(())
    }
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_dir_layout() {
        let paths = AppPaths::in_dir(Path::new("base"), true);
        assert_eq!(paths.config, PathBuf::from("base/config.yaml"));
        assert_eq!(paths.logs_dir, PathBuf::from("base/logs"));
        assert!(paths.is_portable);
    }

    #[test]
    fn test_config_override() {
        let paths = AppPaths::in_dir(Path::new("base"), false);
        assert_eq!(paths.config_path(None), PathBuf::from("base/config.yaml"));
        assert_eq!(
            paths.config_path(Some("other.yaml")),
            PathBuf::from("other.yaml")
        );
    }

    #[test]
    fn test_ensure_directories_creates_logs() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let paths = AppPaths::in_dir(temp.path(), true);

        paths.ensure_directories()?;
        assert!(paths.logs_dir.is_dir());
        assert!(!paths.config.exists());
        Ok(())
    }
}
