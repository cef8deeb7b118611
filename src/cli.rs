//! Command-line argument parsing

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::{Config, VERSION};

/// Multi-backend LLM request gateway
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = VERSION)]
#[command(about = "Multi-backend LLM request gateway", long_about = None)]
pub struct Cli {
    /// Address to bind the gateway server to
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Path to the SQLite database
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Directory for log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Default log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Overlay CLI flags onto the loaded configuration
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if let Some(log_dir) = self.log_dir {
            config.log_dir = log_dir;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "switchboard",
            "--bind",
            "0.0.0.0:9000",
            "--log-level",
            "debug",
        ]);
        let config = cli.apply(Config::default());
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.log_level, "debug");
        // Untouched values keep their defaults
        assert!(config.db_path.to_string_lossy().ends_with("switchboard.db"));
    }
}
