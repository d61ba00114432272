//! Command-line flags.

use crate::config::SslVerificationMode;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "drover-launcher")]
#[command(author, version, about = "Keeps the Drover agent runtime running", long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "DROVER_LAUNCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server the agent connects to
    #[arg(long, alias = "serverUrl", env = "DROVER_SERVER_URL")]
    pub server_url: Option<String>,

    /// NONE, NO_VERIFY_HOST or FULL
    #[arg(long, alias = "sslVerificationMode", env = "DROVER_SSL_VERIFICATION_MODE")]
    pub ssl_verification_mode: Option<SslVerificationMode>,

    /// CA certificate used to verify the server
    #[arg(long, alias = "rootCertFile", env = "DROVER_ROOT_CERT_FILE")]
    pub root_cert_file: Option<PathBuf>,

    /// Agent runtime jar
    #[arg(long, env = "DROVER_AGENT_JAR")]
    pub agent_jar: Option<PathBuf>,

    /// Directory for the launcher log and captured agent output
    #[arg(long, env = "DROVER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Run the agent once and exit with its exit code
    #[arg(long)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_legacy_flag_names() {
        let cli = Cli::parse_from([
            "drover-launcher",
            "--serverUrl",
            "https://ci.example.com/go",
            "--sslVerificationMode",
            "FULL",
            "--once",
        ]);
        assert_eq!(cli.server_url.as_deref(), Some("https://ci.example.com/go"));
        assert_eq!(cli.ssl_verification_mode, Some(SslVerificationMode::Full));
        assert!(cli.once);
    }

    #[test]
    fn test_rejects_unknown_ssl_mode() {
        let result = Cli::try_parse_from(["drover-launcher", "--ssl-verification-mode", "sometimes"]);
        assert!(result.is_err());
    }
}
