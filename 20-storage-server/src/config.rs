//! Typed settings shared by the server and client halves.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::endpoint::Endpoint;

pub const SOCKET_FILE: &str = "commoncache.socket";
pub const DATABASE_FILE: &str = "commoncache.db";
pub const DEFAULT_PORT: u16 = 59994;

/// Lifecycle knobs normally supplied by the host application.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Emit diagnostic logging beyond lifecycle events.
    #[arg(long, global = true, env = "STORAGE_SERVER_DEBUG")]
    pub debug: bool,

    /// Diagnostic verbosity (0-5) used when --debug is set.
    #[arg(long, global = true, env = "STORAGE_SERVER_LOG_LEVEL", default_value_t = 3)]
    pub log_level: u8,

    /// Seconds without a client before the server idles (daemon) or exits (instance).
    #[arg(long = "idle-timeout", global = true, env = "STORAGE_SERVER_IDLE_TIMEOUT", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Loopback port used when Unix sockets are unavailable.
    #[arg(long, global = true, env = "STORAGE_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Run as a long-lived daemon instead of an on-demand instance.
    #[arg(long, global = true, env = "STORAGE_SERVER_AUTOSTART")]
    pub autostart: bool,

    /// Writable directory holding the socket and database files.
    #[arg(long, global = true, env = "STORAGE_SERVER_TEMP_DIR", default_value_os_t = std::env::temp_dir())]
    pub temp_dir: PathBuf,

    /// Use loopback TCP even where Unix sockets are available.
    #[arg(long, global = true, env = "STORAGE_SERVER_TCP")]
    pub tcp: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: 3,
            idle_timeout_secs: 30,
            port: DEFAULT_PORT,
            autostart: false,
            temp_dir: std::env::temp_dir(),
            tcp: false,
        }
    }
}

impl Settings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.temp_dir.join(SOCKET_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.join(DATABASE_FILE)
    }

    /// Unix socket in the temp dir where the platform has them, loopback TCP otherwise.
    pub fn endpoint(&self) -> Endpoint {
        if self.tcp || !cfg!(unix) {
            Endpoint::loopback(self.port)
        } else {
            Endpoint::Unix(self.socket_path())
        }
    }

    pub fn server_mode(&self) -> ServerMode {
        if self.autostart {
            ServerMode::Daemon
        } else {
            ServerMode::Instance
        }
    }

    /// Default `EnvFilter` directive when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        match (self.debug, self.log_level) {
            (false, _) => "info",
            (true, 0..=3) => "debug",
            (true, _) => "trace",
        }
    }
}

/// How the server loop reacts once it has been idle past the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerMode {
    /// Keep listening forever; only an abort signal stops the loop.
    Daemon,
    /// Exit the loop once idle, to be restarted on demand.
    Instance,
}

/// Chunking and timeout parameters of the framed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingConfig {
    pub chunk_size: usize,
    pub progress_timeout: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            progress_timeout: Duration::from_secs(10),
        }
    }
}
