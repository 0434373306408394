//! Process-level entrypoint flags. Runtime limits are read separately from
//! the environment by [`crate::config::Limits`]; these are the flags that
//! belong to the binary itself, following the teacher's split between
//! `StartCommand` flags and context carried elsewhere.

use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone)]
#[command(name = "unideploy-gateway")]
pub struct StartArgs {
    /// Address the HTTP/WS surface binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,

    /// Path to the sqlite database file. Created if missing.
    #[arg(long, env = "DATABASE_PATH", default_value = "unideploy.sqlite")]
    pub database_path: String,

    /// `pretty` for human-readable logs, `json` for structured production logs.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Reconciler tick period, in seconds.
    #[arg(long, env = "RECONCILE_PERIOD_SECS", default_value_t = 120)]
    pub reconcile_period_secs: u64,

    /// Health-probe sub-loop period, in seconds.
    #[arg(long, env = "HEALTH_PROBE_PERIOD_SECS", default_value_t = 300)]
    pub health_probe_period_secs: u64,

    /// Base URL of the out-of-process sandbox provider daemon. When unset,
    /// an in-process mock provider is used instead.
    #[arg(long, env = "SANDBOX_PROVIDER_URL")]
    pub sandbox_provider_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}
