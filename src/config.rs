use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Thread layout of the runtime
    pub runtime: RuntimeConfig,

    /// Settings applied to every connection
    pub connection: ConnectionSettings,

    /// Log level
    pub log_level: String,
}

/// Thread layout shared by all connections of a runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Event loops dedicated to listeners
    pub accept_threads: usize,

    /// Event loops for connected sockets
    pub io_threads: usize,

    /// Threads running sends and other blocking work
    pub worker_threads: usize,

    /// Bounded queue length of the worker pool
    pub worker_queue: usize,

    /// Upper bound on how long a loop sleeps in its selector
    pub poll_interval_ms: u64,
}

/// Per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Host to bind or connect to
    pub host: String,

    /// Port to bind or connect to
    pub port: u16,

    /// Bound for connect, synchronous reads and the TLS handshake wait
    pub read_timeout_ms: u64,

    /// Bound for acquiring the send permit and flushing a message
    pub send_timeout_ms: u64,

    /// Idle interval in seconds (0 disables idle detection)
    pub idle_interval_s: u64,

    /// Scratch buffer size for one socket read
    pub read_buffer_size: usize,

    /// Largest chunk handed to the socket in one write
    pub send_buffer_size: usize,

    /// Socket reads per readiness event before yielding to other sources
    pub read_recursion_depth: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// TLS material (None for plaintext)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

/// PEM files for TLS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain presented by a server
    pub cert_path: Option<String>,

    /// Private key of a server
    pub key_path: Option<String>,

    /// Trust anchors used by a client
    pub ca_path: Option<String>,

    /// Name a client expects in the server certificate
    pub server_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            connection: ConnectionSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            accept_threads: 1,
            io_threads: cpus,
            worker_threads: cpus,
            worker_queue: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2816,
            read_timeout_ms: 3_000,
            send_timeout_ms: 3_000,
            idle_interval_s: 0,
            read_buffer_size: 16 * 1024, // 16KB
            send_buffer_size: 16 * 1024,
            read_recursion_depth: 1,
            tcp_nodelay: true,
            tls: None,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate the thread layout
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.accept_threads == 0 {
            anyhow::bail!("accept_threads must be > 0");
        }

        if self.io_threads == 0 {
            anyhow::bail!("io_threads must be > 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("worker_threads must be > 0");
        }

        if self.worker_queue == 0 {
            anyhow::bail!("worker_queue must be > 0");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be > 0");
        }

        Ok(())
    }
}

impl ConnectionSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// `None` when idle detection is off.
    pub fn idle_interval(&self) -> Option<Duration> {
        (self.idle_interval_s > 0).then(|| Duration::from_secs(self.idle_interval_s))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate connection settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("host must not be empty");
        }

        if self.read_buffer_size < 512 {
            anyhow::bail!("read_buffer_size must be >= 512");
        }

        if self.send_buffer_size < 512 {
            anyhow::bail!("send_buffer_size must be >= 512");
        }

        if self.read_recursion_depth == 0 {
            anyhow::bail!("read_recursion_depth must be > 0");
        }

        if self.read_timeout_ms == 0 || self.send_timeout_ms == 0 {
            anyhow::bail!("read_timeout_ms and send_timeout_ms must be > 0");
        }

        if let Some(tls) = &self.tls {
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                anyhow::bail!("tls cert_path and key_path must be set together");
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sockloop::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("sockloop.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.runtime.validate()?;
        self.connection.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.connection.read_recursion_depth, 1);
        assert_eq!(config.connection.idle_interval(), None);
        assert_eq!(config.runtime.accept_threads, 1);
    }

    #[test]
    fn toml_round_trip() {
        let path = std::env::temp_dir().join(format!("sockloop-config-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.connection.port = 9000;
        config.connection.idle_interval_s = 5;
        config.connection.tls = Some(TlsSettings {
            cert_path: Some("cert.pem".into()),
            key_path: Some("key.pem".into()),
            ..Default::default()
        });

        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.connection.port, 9000);
        assert_eq!(loaded.connection.idle_interval(), Some(Duration::from_secs(5)));
        assert_eq!(
            loaded.connection.tls.and_then(|tls| tls.key_path).as_deref(),
            Some("key.pem")
        );
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[connection]\nport = 7000\n").unwrap();
        assert_eq!(config.connection.port, 7000);
        assert_eq!(config.connection.host, "127.0.0.1");
        assert_eq!(config.runtime.poll_interval_ms, 100);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.connection.read_recursion_depth = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.runtime.io_threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.tls = Some(TlsSettings {
            cert_path: Some("cert.pem".into()),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
