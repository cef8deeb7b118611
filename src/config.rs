//! Configuration for the gateway process
//!
//! Only process-level settings live here (bind address, database path,
//! logging); platform, model, routing and key configuration is stored in
//! the database and managed through the control API.
//!
//! Precedence, highest first:
//! 1. CLI flags
//! 2. Environment variables (`SWITCHBOARD_*`)
//! 3. Config file (`~/.config/switchboard/config.toml`)
//! 4. Built-in defaults

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the gateway server to
    pub bind_addr: SocketAddr,

    /// Path to the SQLite database
    pub db_path: PathBuf,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// Default log level when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            db_path: PathBuf::from("./data/switchboard.db"),
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

/// Optional values as they appear in the config file
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    db_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Self {
        let mut config = Config::default();
        config.apply_file();
        config.apply_env();
        config
    }

    /// Path of the config file, if a config directory exists
    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("switchboard").join("config.toml"))
    }

    fn apply_file(&mut self) {
        let Some(path) = Self::config_file_path() else {
            return;
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        match toml::from_str::<FileConfig>(&contents) {
            Ok(file) => {
                if let Some(bind) = file.bind_addr.and_then(|b| b.parse().ok()) {
                    self.bind_addr = bind;
                }
                if let Some(db_path) = file.db_path {
                    self.db_path = db_path;
                }
                if let Some(log_dir) = file.log_dir {
                    self.log_dir = log_dir;
                }
                if let Some(log_level) = file.log_level {
                    self.log_level = log_level;
                }
            }
            Err(e) => eprintln!("Warning: could not parse {}: {}", path.display(), e),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("SWITCHBOARD_BIND") {
            match bind.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(e) => eprintln!("Warning: invalid SWITCHBOARD_BIND '{}': {}", bind, e),
            }
        }
        if let Ok(db_path) = std::env::var("SWITCHBOARD_DB") {
            self.db_path = PathBuf::from(db_path);
        }
        if let Ok(log_dir) = std::env::var("SWITCHBOARD_LOG_DIR") {
            self.log_dir = PathBuf::from(log_dir);
        }
        if let Ok(log_level) = std::env::var("SWITCHBOARD_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }
}
