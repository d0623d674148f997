//! Shipper configuration loading.
//!
//! Three layers, highest precedence first: command line, YAML config file
//! (`--config`), compiled defaults.  A zero or empty value in a layer means
//! "unset" and defers to the next layer down, so a config file can be
//! partial and a command line can override single options.
//!
//! An unreadable or unparseable config file is logged and skipped; a field
//! of the wrong type falls back to the layer below.  The only fatal parse
//! errors are an unrecognized `encoding` or `compression` value.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::warn;
use url::Url;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Outbound frame encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Binary,
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "binary" => Ok(Encoding::Binary),
            other => Err(ConfigError::InvalidValue(format!(
                "encoding must be 'json' or 'binary', got '{other}'"
            ))),
        }
    }
}

/// Compression applied to binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Snappy,
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "snappy" => Ok(Compression::Snappy),
            other => Err(ConfigError::InvalidValue(format!(
                "compression must be 'none' or 'snappy', got '{other}'"
            ))),
        }
    }
}

/// Fully-resolved shipper configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipperConfig {
    pub redis_url: String,
    pub consumer_url: String,
    pub readers: usize,
    pub writers: usize,
    pub max_buffer_size: usize,
    pub max_batch_size: usize,
    pub batch_timeout_seconds: f64,
    pub encoding: Encoding,
    pub compression: Compression,
    pub backoff_window_seconds: u64,
    pub max_backoff_steps: u32,
    pub max_backoff_delay_ms: u64,
    pub retry_connection_timeout_seconds: u64,
    pub max_connection_age_seconds: u64,
    pub username: String,
    pub password: String,
    pub num_cpus: usize,
    pub stats_interval_seconds: u64,
    pub publish_error_metrics: bool,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        ShipperConfig {
            redis_url: "redis://localhost:6379/0/metrics".to_owned(),
            consumer_url: "ws://localhost:8080/ws/metrics/store".to_owned(),
            readers: 2,
            writers: 1,
            max_buffer_size: 1024,
            max_batch_size: 128,
            batch_timeout_seconds: 1.0,
            encoding: Encoding::Json,
            compression: Compression::None,
            backoff_window_seconds: 60,
            max_backoff_steps: 16,
            max_backoff_delay_ms: 10_000,
            retry_connection_timeout_seconds: 5,
            max_connection_age_seconds: 0,
            username: String::new(),
            password: String::new(),
            num_cpus: 0,
            stats_interval_seconds: 60,
            publish_error_metrics: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue URI
// ---------------------------------------------------------------------------

/// Parsed form of `redis://HOST:PORT/DB/CHANNEL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub dialect: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub channel: String,
}

impl QueueConfig {
    pub fn parse(uri: &str) -> Result<QueueConfig, ConfigError> {
        let parsed = Url::parse(uri)
            .map_err(|e| ConfigError::InvalidValue(format!("queue URI '{uri}': {e}")))?;
        let mut segments = parsed
            .path_segments()
            .map(Iterator::collect::<Vec<_>>)
            .unwrap_or_default()
            .into_iter();
        Ok(QueueConfig {
            dialect: parsed.scheme().to_owned(),
            host: parsed.host_str().unwrap_or("localhost").to_owned(),
            port: parsed.port().unwrap_or(6379),
            database: segments.next().filter(|s| !s.is_empty()).unwrap_or("0").to_owned(),
            channel: segments
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("metrics")
                .to_owned(),
        })
    }

    /// `host:port`, what the dialer connects to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Legacy pub/sub notification channel, derived for ecosystem
    /// compatibility; the drain loop itself polls.
    pub fn control_channel(&self) -> String {
        format!("{}-control", self.channel)
    }

    /// Regenerate the URI this config was parsed from.
    pub fn to_uri(&self) -> String {
        format!(
            "{}://{}:{}/{}/{}",
            self.dialect, self.host, self.port, self.database, self.channel
        )
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load configuration from `std::env::args` plus the optional config file.
pub fn load() -> Result<ShipperConfig, ConfigError> {
    let matches = cli().get_matches();
    let file = matches
        .get_one::<String>("config")
        .and_then(|path| read_config_file(Path::new(path)));
    from_sources(&matches, file.as_deref())
}

/// The command-line surface.  Options carry no clap defaults so an absent
/// option is distinguishable from an explicit one during the merge.
pub fn cli() -> Command {
    Command::new("Metric Shipper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drains telemetry records from a queue and ships them to a consumer")
        .arg(
            Arg::new("config")
                .help("Path to YAML configuration file")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("redis-url")
                .help("Queue URL to drain, redis://HOST:PORT/DB/CHANNEL")
                .long("redis-url"),
        )
        .arg(
            Arg::new("consumer-url")
                .help("WebSocket URL of the consumer to publish to")
                .long("consumer-url"),
        )
        .arg(
            Arg::new("readers")
                .help("Maximum number of simultaneous queue readers")
                .long("readers")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("writers")
                .help("Maximum number of simultaneous writers to the consumer")
                .long("writers")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-buffer-size")
                .help("Maximum number of records to keep in the internal buffer")
                .long("max-buffer-size")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-batch-size")
                .help("Records to send to the consumer in a single call; should be smaller than the buffer size")
                .long("max-batch-size")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch-timeout-seconds")
                .help("Maximum time to wait for a full batch before sending a partial one")
                .long("batch-timeout-seconds")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("encoding")
                .help("Outbound frame encoding: json or binary")
                .long("encoding"),
        )
        .arg(
            Arg::new("compression")
                .help("Binary frame compression: none or snappy")
                .long("compression"),
        )
        .arg(
            Arg::new("backoff-window-seconds")
                .help("Rolling period over which consumer collisions are counted")
                .long("backoff-window-seconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-backoff-steps")
                .help("Maximum number of collisions considered for exponential backoff")
                .long("max-backoff-steps")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("max-backoff-delay")
                .help("Backoff delay in milliseconds at the collision cap")
                .long("max-backoff-delay")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("retry-connection-timeout")
                .help("Seconds to sleep between consumer dial attempts")
                .long("retry-connection-timeout")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-connection-age")
                .help("Rotate consumer connections older than this many seconds; 0 never rotates")
                .long("max-connection-age")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("username")
                .help("Username for consumer basic auth")
                .long("username"),
        )
        .arg(
            Arg::new("password")
                .help("Password for consumer basic auth")
                .long("password"),
        )
        .arg(
            Arg::new("num-cpus")
                .help("Number of worker threads; 0 uses all logical CPUs")
                .long("num-cpus")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("stats-interval")
                .help("Seconds between internal stats emissions")
                .long("stats-interval")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("publish-error-metrics")
                .help("Ship error-flagged records in a segregated batch instead of dropping them")
                .long("publish-error-metrics")
                .action(ArgAction::SetTrue),
        )
}

/// Merge the three layers into a resolved config.
///
/// Exposed separately from [`load`] so tests can drive it with
/// `cli().get_matches_from(...)` and an inline YAML string.
pub fn from_sources(
    matches: &ArgMatches,
    yaml: Option<&str>,
) -> Result<ShipperConfig, ConfigError> {
    let file = yaml.map(FileOverrides::parse).unwrap_or_default();
    let defaults = ShipperConfig::default();

    let encoding = match pick_string(matches, "encoding", file.encoding) {
        Some(raw) => raw.parse()?,
        None => defaults.encoding,
    };
    let compression = match pick_string(matches, "compression", file.compression) {
        Some(raw) => raw.parse()?,
        None => defaults.compression,
    };

    let config = ShipperConfig {
        redis_url: pick_string(matches, "redis-url", file.redis_url)
            .unwrap_or(defaults.redis_url),
        consumer_url: pick_string(matches, "consumer-url", file.consumer_url)
            .unwrap_or(defaults.consumer_url),
        readers: pick_number(matches, "readers", file.readers).unwrap_or(defaults.readers),
        writers: pick_number(matches, "writers", file.writers).unwrap_or(defaults.writers),
        max_buffer_size: pick_number(matches, "max-buffer-size", file.max_buffer_size)
            .unwrap_or(defaults.max_buffer_size),
        max_batch_size: pick_number(matches, "max-batch-size", file.max_batch_size)
            .unwrap_or(defaults.max_batch_size),
        batch_timeout_seconds: matches
            .get_one::<f64>("batch-timeout-seconds")
            .copied()
            .filter(|v| *v != 0.0)
            .or(file.batch_timeout_seconds.filter(|v| *v != 0.0))
            .unwrap_or(defaults.batch_timeout_seconds),
        encoding,
        compression,
        backoff_window_seconds: pick_number(
            matches,
            "backoff-window-seconds",
            file.backoff_window_seconds,
        )
        .unwrap_or(defaults.backoff_window_seconds),
        max_backoff_steps: pick_number(matches, "max-backoff-steps", file.max_backoff_steps)
            .unwrap_or(defaults.max_backoff_steps),
        max_backoff_delay_ms: pick_number(matches, "max-backoff-delay", file.max_backoff_delay)
            .unwrap_or(defaults.max_backoff_delay_ms),
        retry_connection_timeout_seconds: pick_number(
            matches,
            "retry-connection-timeout",
            file.retry_connection_timeout,
        )
        .unwrap_or(defaults.retry_connection_timeout_seconds),
        max_connection_age_seconds: matches
            .get_one::<u64>("max-connection-age")
            .copied()
            .or(file.max_connection_age)
            .unwrap_or(defaults.max_connection_age_seconds),
        username: pick_string(matches, "username", file.username).unwrap_or(defaults.username),
        password: pick_string(matches, "password", file.password).unwrap_or(defaults.password),
        num_cpus: pick_number(matches, "num-cpus", file.num_cpus).unwrap_or(defaults.num_cpus),
        stats_interval_seconds: pick_number(matches, "stats-interval", file.stats_interval)
            .unwrap_or(defaults.stats_interval_seconds),
        publish_error_metrics: matches.get_flag("publish-error-metrics")
            || file.publish_error_metrics.unwrap_or(false),
    };

    // The pipeline degenerates without at least one of each.
    for (name, value) in [
        ("readers", config.readers),
        ("writers", config.writers),
        ("max-buffer-size", config.max_buffer_size),
        ("max-batch-size", config.max_batch_size),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{name} must be at least 1"
            )));
        }
    }
    if !config.batch_timeout_seconds.is_finite() || config.batch_timeout_seconds <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "batch-timeout-seconds must be positive".to_owned(),
        ));
    }
    if config.compression == Compression::Snappy && config.encoding == Encoding::Json {
        return Err(ConfigError::InvalidValue(
            "compression requires binary encoding".to_owned(),
        ));
    }

    Ok(config)
}

// ---------------------------------------------------------------------------
// File layer
// ---------------------------------------------------------------------------

/// One Option per overridable field.  Parsed tolerantly: a key of the wrong
/// type is treated as absent rather than failing the whole file.
#[derive(Debug, Default)]
struct FileOverrides {
    redis_url: Option<String>,
    consumer_url: Option<String>,
    readers: Option<usize>,
    writers: Option<usize>,
    max_buffer_size: Option<usize>,
    max_batch_size: Option<usize>,
    batch_timeout_seconds: Option<f64>,
    encoding: Option<String>,
    compression: Option<String>,
    backoff_window_seconds: Option<u64>,
    max_backoff_steps: Option<u32>,
    max_backoff_delay: Option<u64>,
    retry_connection_timeout: Option<u64>,
    max_connection_age: Option<u64>,
    username: Option<String>,
    password: Option<String>,
    num_cpus: Option<usize>,
    stats_interval: Option<u64>,
    publish_error_metrics: Option<bool>,
}

impl FileOverrides {
    fn parse(yaml: &str) -> FileOverrides {
        let value: serde_yaml::Value = match serde_yaml::from_str(yaml) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "config file is not valid YAML; ignoring");
                return FileOverrides::default();
            }
        };
        let map: BTreeMap<String, serde_yaml::Value> = match serde_yaml::from_value(value) {
            Ok(m) => m,
            Err(_) => {
                warn!("config file is not a mapping; ignoring");
                return FileOverrides::default();
            }
        };

        let string = |key: &str| map.get(key).and_then(|v| v.as_str()).map(str::to_owned);
        let unsigned = |key: &str| map.get(key).and_then(serde_yaml::Value::as_u64);
        FileOverrides {
            redis_url: string("redis-url"),
            consumer_url: string("consumer-url"),
            readers: unsigned("readers").map(|v| v as usize),
            writers: unsigned("writers").map(|v| v as usize),
            max_buffer_size: unsigned("max-buffer-size").map(|v| v as usize),
            max_batch_size: unsigned("max-batch-size").map(|v| v as usize),
            batch_timeout_seconds: map
                .get("batch-timeout-seconds")
                .and_then(serde_yaml::Value::as_f64),
            encoding: string("encoding"),
            compression: string("compression"),
            backoff_window_seconds: unsigned("backoff-window-seconds"),
            max_backoff_steps: unsigned("max-backoff-steps").map(|v| v as u32),
            max_backoff_delay: unsigned("max-backoff-delay"),
            retry_connection_timeout: unsigned("retry-connection-timeout"),
            max_connection_age: unsigned("max-connection-age"),
            username: string("username"),
            password: string("password"),
            num_cpus: unsigned("num-cpus").map(|v| v as usize),
            stats_interval: unsigned("stats-interval"),
            publish_error_metrics: map
                .get("publish-error-metrics")
                .and_then(serde_yaml::Value::as_bool),
        }
    }
}

fn read_config_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unable to read config file; ignoring");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Merge helpers
// ---------------------------------------------------------------------------

/// Command line over file; empty strings count as unset.
fn pick_string(matches: &ArgMatches, key: &str, file: Option<String>) -> Option<String> {
    matches
        .get_one::<String>(key)
        .cloned()
        .filter(|s| !s.is_empty())
        .or(file.filter(|s| !s.is_empty()))
}

/// Command line over file; zeros count as unset (so a partial layer defers
/// to the defaults, matching the merge the shipper has always done).
fn pick_number<T>(matches: &ArgMatches, key: &str, file: Option<T>) -> Option<T>
where
    T: Copy + Default + PartialEq + Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(key)
        .copied()
        .filter(|v| *v != T::default())
        .or(file.filter(|v| *v != T::default()))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
