//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::calling::controller::ControllerConfig;
use crate::calling::media::VideoConstraints;
use crate::calling::peer::{IceServer, RtcConfig};

pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:5000";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Socket.IO signaling server
    pub signaling_url: String,
    /// Our user id on the signaling server
    pub user_id: Option<String>,
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// Camera capture constraints for video calls
    pub video: VideoConstraints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            user_id: None,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            video: VideoConstraints::default(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Keep the user id private
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn user_id(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .context("No user id configured. Run `peercall config --user-id <ID>` first.")
    }

    /// Settings for the call controller.
    pub fn controller_config(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            user_id: self.user_id()?.to_string(),
            rtc: RtcConfig {
                ice_servers: self.ice_servers.clone(),
            },
            video: self.video.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("peercall-test-{}", uuid::Uuid::new_v4().simple()))
            .join(name)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.video.height, 480);
        assert!(config.user_id().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            user_id = "64b7f0c2a1"

            [video]
            width = 1280
            height = 720
            "#,
        )
        .unwrap();
        assert_eq!(config.user_id().unwrap(), "64b7f0c2a1");
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.ice_servers, Config::default().ice_servers);
    }

    #[test]
    fn test_custom_turn_server() {
        let config: Config = toml::from_str(
            r#"
            [[ice_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "u"
            credential = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("config.toml");
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let config = Config {
            user_id: Some("me".into()),
            signaling_url: "https://signal.example.com".into(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_controller_config() {
        let config = Config {
            user_id: Some("me".into()),
            ..Config::default()
        };
        let controller = config.controller_config().unwrap();
        assert_eq!(controller.user_id, "me");
        assert_eq!(controller.rtc.ice_servers.len(), 2);

        let empty = Config {
            user_id: Some(String::new()),
            ..Config::default()
        };
        assert!(empty.controller_config().is_err());
    }
}
