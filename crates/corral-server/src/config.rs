//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use corral_api::remote::ProxyConfig;
use corral_api::server::{ServerConfig, TlsFiles};
use corral_api::AuthenticatorConfig;
use corral_common::telemetry::{LogFormat, LoggingConfig};
use corral_common::DEFAULT_SESSION_COOKIE;
use corral_refresh::RefreshConfig;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogStyle {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable lines
    Plain,
}

/// corral - authenticating proxy in front of downstream clusters
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Print the custom resource definitions as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Address to listen on
    #[arg(long, env = "CORRAL_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: SocketAddr,

    /// TLS certificate chain (PEM); plain HTTP when unset
    #[arg(long, env = "CORRAL_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "CORRAL_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "CORRAL_LOG_FORMAT", value_enum, default_value_t = LogStyle::Json)]
    pub log_format: LogStyle,

    /// Session cookie carrying `<name>:<secret>` for browser clients
    #[arg(long, env = "CORRAL_COOKIE_NAME", default_value = DEFAULT_SESSION_COOKIE)]
    pub cookie_name: String,

    /// Also accept raw ServiceAccount tokens, validated with TokenReview
    #[arg(long, env = "CORRAL_SA_AUTH")]
    pub sa_auth: bool,

    /// Audiences required of ServiceAccount tokens (comma separated)
    #[arg(long, env = "CORRAL_SA_AUDIENCES", value_delimiter = ',')]
    pub sa_audiences: Vec<String>,

    /// `X-Forwarded-Proto` sent downstream when the client sent none;
    /// defaults to the listener's scheme
    #[arg(long, env = "CORRAL_FORWARDED_PROTO")]
    pub forwarded_proto: Option<String>,

    /// Skip triggered refreshes of users refreshed within this many seconds
    #[arg(long, env = "CORRAL_REFRESH_MAX_AGE_SECS", default_value_t = 3600)]
    pub refresh_max_age_secs: u64,

    /// Seconds between full refresh sweeps; 0 disables the sweep
    #[arg(long, env = "CORRAL_REFRESH_INTERVAL_SECS", default_value_t = 3600)]
    pub refresh_interval_secs: u64,

    /// Pending refresh triggers kept before new ones are dropped
    #[arg(long, env = "CORRAL_REFRESH_QUEUE_CAPACITY", default_value_t = 1024)]
    pub refresh_queue_capacity: usize,
}

impl Cli {
    /// Logging settings
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            format: match self.log_format {
                LogStyle::Json => LogFormat::Json,
                LogStyle::Plain => LogFormat::Plain,
            },
            default_filter: None,
        }
    }

    /// Listener settings
    pub fn server(&self) -> ServerConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsFiles {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        ServerConfig {
            addr: self.listen_addr,
            tls,
        }
    }

    /// Token authenticator settings
    pub fn authenticator(&self) -> AuthenticatorConfig {
        AuthenticatorConfig {
            cookie_name: self.cookie_name.clone(),
        }
    }

    /// Remote proxy settings
    pub fn proxy(&self) -> ProxyConfig {
        let listener_proto = if self.server().tls.is_some() {
            "https"
        } else {
            "http"
        };
        ProxyConfig {
            forwarded_proto: self
                .forwarded_proto
                .clone()
                .unwrap_or_else(|| listener_proto.to_string()),
        }
    }

    /// Refresh daemon settings
    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            max_age: Duration::from_secs(self.refresh_max_age_secs),
            sweep_interval: (self.refresh_interval_secs > 0)
                .then(|| Duration::from_secs(self.refresh_interval_secs)),
            queue_capacity: self.refresh_queue_capacity,
        }
    }
}
