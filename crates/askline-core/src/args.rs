use crate::config::ClientConfig;
use crate::logging::LogConfig;
use clap::{ArgAction, Args};
use std::path::PathBuf;

// Global flags shared by every askline entry point.
//
//   -c / --config      Path to a config.toml file
//   --base-url         Service origin for the handshake
//   --timeout          Answer ceiling in seconds
//   -v / --verbose     Protocol-level logging (repeat for trace)
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Path to a config.toml file (default: ~/.askline/config.toml)
    #[arg(
        short = 'c',
        long,
        value_name = "PATH",
        env = "ASKLINE_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Service origin (https://…)
    #[arg(long, value_name = "URL", env = "ASKLINE_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Seconds to wait for an answer
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// More logging; repeat for frame-level detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl CommonArgs {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone()
    }

    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(base_url) = &self.base_url {
            config.service.base_url = base_url.clone();
        }

        if let Some(timeout) = self.timeout {
            config.query.answer_timeout_secs = timeout;
        }
    }

    /// Logging setup implied by `-v`; falls back to the environment.
    pub fn log_config(&self) -> LogConfig {
        match self.verbose {
            0 => LogConfig::from_env(),
            1 => LogConfig::verbose(),
            _ => LogConfig::debug(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_overrides_apply() {
        let cli = TestCli::parse_from([
            "askline",
            "--base-url",
            "http://127.0.0.1:3000",
            "--timeout",
            "5",
        ]);
        let mut config = ClientConfig::default();
        cli.common.apply_overrides(&mut config);
        assert_eq!(config.service.base_url, "http://127.0.0.1:3000");
        assert_eq!(config.query.answer_timeout_secs, 5);
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let cli = TestCli::parse_from(["askline"]);
        let mut config = ClientConfig::default();
        cli.common.apply_overrides(&mut config);
        assert_eq!(config.service.base_url, ClientConfig::default().service.base_url);
        assert_eq!(config.query.answer_timeout_secs, 30);
    }

    #[test]
    fn test_verbosity_levels() {
        let cli = TestCli::parse_from(["askline", "-vv"]);
        assert_eq!(cli.common.verbose, 2);
        assert!(cli.common.log_config().filter.contains("trace"));

        let cli = TestCli::parse_from(["askline", "-v"]);
        assert!(cli.common.log_config().filter.contains("debug"));
    }
}
