//! Server configuration (ambient stack, modeled on the teacher's
//! `GameConfig`/`Server`/`Game` split): a JSON file read at startup,
//! overridable by CLI flags (§3 data model, §5 timeouts, §6 listen port).

use common::logging::LogLevel;
use common::LISTEN_PORT_DEFAULT;
use protocol::pacer::DEFAULT_BURST;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub burst: usize,
    pub co_timeout_secs: u64,
    pub xfer_xg_timeout_secs: u64,
    pub low_color_default: bool,
    pub fdo_template_root: PathBuf,
    pub art_store_root: PathBuf,
    pub users_file: PathBuf,
    pub auth_config_file: PathBuf,
    pub upload_root: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: format!("0.0.0.0:{LISTEN_PORT_DEFAULT}"),
            burst: DEFAULT_BURST,
            co_timeout_secs: 10,
            xfer_xg_timeout_secs: 30,
            low_color_default: false,
            fdo_template_root: PathBuf::from("fdo_templates"),
            art_store_root: PathBuf::from("art_store"),
            users_file: PathBuf::from("users.json"),
            auth_config_file: PathBuf::from("auth_config.json"),
            upload_root: PathBuf::from("uploads"),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn log_level(&self) -> LogLevel {
        match self.log_level.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}
