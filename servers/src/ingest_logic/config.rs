use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "server_ingest.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Telemetry ingestion and real-time push server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "INGEST_PORT", help = "Port for the websocket and HTTP API.")]
    pub port: Option<u16>,

    #[clap(long, env = "INGEST_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_LEVEL", help = "Logging level used when RUST_LOG is not set.")]
    pub log_level: Option<String>,

    #[clap(long, env = "INGEST_DATABASE_URL", help = "PostgreSQL connection URL. Without it an in-memory store is used.")]
    pub database_url: Option<String>,

    #[clap(long, env = "INGEST_DATABASE_POOL_SIZE", help = "Maximum connections per database pool.")]
    pub database_pool_size: Option<usize>,

    #[clap(long, env = "INGEST_BROKER_URL", help = "MQTT broker as host[:port]. Read from the integration settings when absent.")]
    pub broker_url: Option<String>,

    #[clap(long, env = "INGEST_BROKER_USERNAME", help = "MQTT username.")]
    pub broker_username: Option<String>,

    #[clap(long, env = "INGEST_BROKER_PASSWORD", hide_env_values = true, help = "MQTT password.")]
    pub broker_password: Option<String>,

    #[clap(long, env = "INGEST_TOPIC_NAMESPACE", help = "First topic segment of device topics.")]
    pub topic_namespace: Option<String>,

    #[clap(long, env = "INGEST_BROKER_KEEP_ALIVE_SECONDS", help = "MQTT keep-alive in seconds.")]
    pub broker_keep_alive_seconds: Option<u64>,

    #[clap(long, env = "INGEST_BROKER_RECONNECT_SECONDS", help = "Delay between broker reconnect attempts.")]
    pub broker_reconnect_seconds: Option<u64>,

    #[clap(long, env = "INGEST_IMAGE_ROOT", help = "Image directory used when the settings table has none.")]
    pub image_root: Option<PathBuf>,

    #[clap(long, env = "INGEST_LIVENESS_INTERVAL_SECONDS", help = "Seconds between websocket liveness sweeps.")]
    pub liveness_interval_seconds: Option<u64>,

    #[clap(long, env = "INGEST_CASE_ASSIGNEE", help = "User id assigned to new violation cases.")]
    pub case_assignee: Option<i64>,

    #[clap(long, env = "INGEST_MONITOR_INTERVAL_SECONDS", help = "Seconds between pipeline status log lines.")]
    pub monitor_interval_seconds: Option<u64>,

    #[clap(long, env = "INGEST_NORMALIZER_QUEUE_DEPTH", help = "Pending messages accepted by the normalizer worker.")]
    pub normalizer_queue_depth: Option<usize>,
}

impl Config {
    // 'other' wins wherever it has a value
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            database_pool_size: other.database_pool_size.or(self.database_pool_size),
            broker_url: other.broker_url.or(self.broker_url),
            broker_username: other.broker_username.or(self.broker_username),
            broker_password: other.broker_password.or(self.broker_password),
            topic_namespace: other.topic_namespace.or(self.topic_namespace),
            broker_keep_alive_seconds: other.broker_keep_alive_seconds.or(self.broker_keep_alive_seconds),
            broker_reconnect_seconds: other.broker_reconnect_seconds.or(self.broker_reconnect_seconds),
            image_root: other.image_root.or(self.image_root),
            liveness_interval_seconds: other.liveness_interval_seconds.or(self.liveness_interval_seconds),
            case_assignee: other.case_assignee.or(self.case_assignee),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
            normalizer_queue_depth: other.normalizer_queue_depth.or(self.normalizer_queue_depth),
        }
    }

    pub fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            database_pool_size: Some(8),
            topic_namespace: Some(lib_common::pipeline::subscriber::DEFAULT_NAMESPACE.to_string()),
            broker_keep_alive_seconds: Some(60),
            broker_reconnect_seconds: Some(5),
            image_root: Some(PathBuf::from("./images")),
            liveness_interval_seconds: Some(30),
            case_assignee: Some(1),
            monitor_interval_seconds: Some(60),
            normalizer_queue_depth: Some(256),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn database_pool_size(&self) -> usize {
        self.database_pool_size.unwrap_or(8).max(1)
    }

    pub fn topic_namespace(&self) -> &str {
        self.topic_namespace
            .as_deref()
            .unwrap_or(lib_common::pipeline::subscriber::DEFAULT_NAMESPACE)
    }

    pub fn broker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker_keep_alive_seconds.unwrap_or(60))
    }

    pub fn broker_reconnect(&self) -> Duration {
        Duration::from_secs(self.broker_reconnect_seconds.unwrap_or(5))
    }

    pub fn image_root(&self) -> &Path {
        self.image_root.as_deref().unwrap_or(Path::new("./images"))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_seconds.unwrap_or(30).max(1))
    }

    pub fn case_assignee(&self) -> i64 {
        self.case_assignee.unwrap_or(1)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds.unwrap_or(60).max(1))
    }

    pub fn normalizer_queue_depth(&self) -> usize {
        self.normalizer_queue_depth.unwrap_or(256).max(1)
    }
}

/// Loads `.env`, then the platform specific file, into the process environment.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
    #[cfg(target_os = "linux")]
    let _ = dotenvy::from_filename(".env.linux");
    #[cfg(target_os = "windows")]
    let _ = dotenvy::from_filename(".env.windows");
}

/// What happened to the config file during [`load_config`]. Resolution runs
/// before logging is set up, so the outcome is reported afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigFile {
    Loaded(PathBuf),
    Missing(PathBuf),
    Ignored { path: PathBuf, reason: String },
}

impl ConfigFile {
    pub fn log(&self) {
        match self {
            ConfigFile::Loaded(path) => tracing::info!(path = %path.display(), "Config file loaded"),
            ConfigFile::Missing(path) => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults and environment")
            }
            ConfigFile::Ignored { path, reason } => {
                tracing::warn!(path = %path.display(), %reason, "Config file ignored")
            }
        }
    }
}

/// defaults < config file < environment and command line.
pub fn load_config() -> (Config, ConfigFile) {
    resolve(Config::parse())
}

fn resolve(cli: Config) -> (Config, ConfigFile) {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    let file = match read_config_file(&config_file_path) {
        Ok(Some(file_config)) => {
            current_config = current_config.merge(file_config);
            ConfigFile::Loaded(config_file_path)
        }
        Ok(None) => ConfigFile::Missing(config_file_path),
        Err(reason) => ConfigFile::Ignored {
            path: config_file_path,
            reason,
        },
    };

    (current_config.merge(cli), file)
}

fn read_config_file(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let config_str = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str::<Config>(&config_str)
        .map(Some)
        .map_err(|e| e.to_string())
}
