//! Launcher configuration.

use crate::cli::Cli;
use drover_supervisor::{CommandSpec, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("Unknown SSL verification mode {0:?}, expected NONE, NO_VERIFY_HOST or FULL")]
    InvalidSslMode(String),

    #[error("Root certificate file {0} does not exist")]
    MissingRootCert(PathBuf),
}

/// How the agent runtime verifies the server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslVerificationMode {
    #[default]
    None,
    NoVerifyHost,
    Full,
}

impl fmt::Display for SslVerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslVerificationMode::None => write!(f, "NONE"),
            SslVerificationMode::NoVerifyHost => write!(f, "NO_VERIFY_HOST"),
            SslVerificationMode::Full => write!(f, "FULL"),
        }
    }
}

impl FromStr for SslVerificationMode {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(SslVerificationMode::None),
            "NO_VERIFY_HOST" => Ok(SslVerificationMode::NoVerifyHost),
            "FULL" => Ok(SslVerificationMode::Full),
            _ => Err(LauncherError::InvalidSslMode(s.to_string())),
        }
    }
}

/// Launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub ssl_verification_mode: SslVerificationMode,
    #[serde(default)]
    pub root_cert_file: Option<PathBuf>,
    #[serde(default = "default_agent_jar")]
    pub agent_jar: PathBuf,
    #[serde(default = "default_java")]
    pub java: String,
    /// Replaces the default agent command line. `${Env.NAME}` tokens are
    /// substituted.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_server_url() -> String {
    "https://localhost:8154/go".to_string()
}

fn default_agent_jar() -> PathBuf {
    PathBuf::from("agent.jar")
}

fn default_java() -> String {
    "java".to_string()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            ssl_verification_mode: SslVerificationMode::default(),
            root_cert_file: None,
            agent_jar: default_agent_jar(),
            java: default_java(),
            command: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl LauncherConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, LauncherError> {
        let contents = std::fs::read_to_string(path).map_err(|source| LauncherError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| LauncherError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Config file (if any) with command-line flags applied on top.
    pub fn load(cli: &Cli) -> Result<Self, LauncherError> {
        let config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_overrides(cli))
    }

    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(url) = &cli.server_url {
            self.server_url = url.clone();
        }
        if let Some(mode) = cli.ssl_verification_mode {
            self.ssl_verification_mode = mode;
        }
        if let Some(cert) = &cli.root_cert_file {
            self.root_cert_file = Some(cert.clone());
        }
        if let Some(jar) = &cli.agent_jar {
            self.agent_jar = jar.clone();
        }
        if let Some(dir) = &cli.log_dir {
            self.supervisor.log_dir = dir.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<(), LauncherError> {
        let url = url::Url::parse(&self.server_url).map_err(|e| LauncherError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LauncherError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if let Some(cert) = &self.root_cert_file
            && !cert.exists()
        {
            return Err(LauncherError::MissingRootCert(cert.clone()));
        }
        Ok(())
    }

    /// The supervised command line. Connection settings travel as
    /// command-scoped variables so the template can reference them.
    pub fn command_spec(&self) -> CommandSpec {
        let args = match &self.command {
            Some(args) => args.clone(),
            None => {
                let mut args = vec![
                    self.java.clone(),
                    "-jar".to_string(),
                    self.agent_jar.display().to_string(),
                    "-serverUrl".to_string(),
                    "${Env.SERVER_URL}".to_string(),
                    "-sslVerificationMode".to_string(),
                    "${Env.SSL_VERIFICATION_MODE}".to_string(),
                ];
                if self.root_cert_file.is_some() {
                    args.push("-rootCertFile".to_string());
                    args.push("${Env.ROOT_CERT_FILE}".to_string());
                }
                args
            }
        };

        let mut spec = CommandSpec::new(args)
            .with_variable("SERVER_URL", self.server_url.clone())
            .with_variable("SSL_VERIFICATION_MODE", self.ssl_verification_mode.to_string());
        if let Some(cert) = &self.root_cert_file {
            spec = spec.with_variable("ROOT_CERT_FILE", cert.display().to_string());
        }
        spec
    }
}
