//! Configuration for the RTSP → HLS gateway
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! Every timeout, encode parameter and size limit lives here; nothing in the
//! session flow hard-codes a constant.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where session output directories live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Transcoder binary and encode profile
    #[serde(default)]
    pub transcoder: TranscoderConfig,

    /// Pre-flight probe settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Readiness polling settings
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Process registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Notification settings
    #[serde(default)]
    pub events: EventsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Externally reachable URL under which `storage.root` is served
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_public_base_url() -> String {
    "http://localhost:8000/static/streams".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Output storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; each session writes to `<root>/<stream_id>`
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./static/streams")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Transcoder invocation profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Path or name of the ffmpeg executable
    #[serde(default = "default_binary")]
    pub binary: String,

    /// ffmpeg `-loglevel`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Forced RTSP transport (`tcp` or `udp`)
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,

    /// `-analyzeduration` in microseconds
    #[serde(default = "default_analyze_duration")]
    pub analyze_duration_us: u64,

    /// `-probesize` in bytes
    #[serde(default = "default_probe_size")]
    pub probe_size: u64,

    /// Socket connect/read timeout passed to the RTSP demuxer
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default = "default_tune")]
    pub tune: String,

    /// Keyframe interval in frames
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,

    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_kbps: u32,

    #[serde(default = "default_buffer_size")]
    pub buffer_size_kbps: u32,

    /// Audio codec; an empty string drops audio (`-an`)
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// `-hls_time` in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,

    /// `-hls_list_size`
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// `-hls_flags`; empty disables the option
    #[serde(default = "default_hls_flags")]
    pub hls_flags: String,

    /// Playlist filename inside the session directory
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    /// Segment file extension (without the dot)
    #[serde(default = "default_segment_extension")]
    pub segment_extension: String,

    /// How many trailing stderr lines are kept per process
    #[serde(default = "default_diagnostic_tail")]
    pub diagnostic_tail_lines: usize,
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_rtsp_transport() -> String {
    "tcp".to_string()
}

fn default_analyze_duration() -> u64 {
    1_000_000
}

fn default_probe_size() -> u64 {
    1_000_000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_tune() -> String {
    "zerolatency".to_string()
}

fn default_gop_size() -> u32 {
    30
}

fn default_max_bitrate() -> u32 {
    1500
}

fn default_buffer_size() -> u32 {
    3000
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_segment_duration() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    3
}

fn default_hls_flags() -> String {
    "delete_segments".to_string()
}

fn default_manifest_name() -> String {
    "index.m3u8".to_string()
}

fn default_segment_extension() -> String {
    "ts".to_string()
}

fn default_diagnostic_tail() -> usize {
    40
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            log_level: default_log_level(),
            rtsp_transport: default_rtsp_transport(),
            analyze_duration_us: default_analyze_duration(),
            probe_size: default_probe_size(),
            connect_timeout_ms: default_connect_timeout(),
            video_codec: default_video_codec(),
            preset: default_preset(),
            tune: default_tune(),
            gop_size: default_gop_size(),
            max_bitrate_kbps: default_max_bitrate(),
            buffer_size_kbps: default_buffer_size(),
            audio_codec: default_audio_codec(),
            segment_duration_secs: default_segment_duration(),
            playlist_size: default_playlist_size(),
            hls_flags: default_hls_flags(),
            manifest_name: default_manifest_name(),
            segment_extension: default_segment_extension(),
            diagnostic_tail_lines: default_diagnostic_tail(),
        }
    }
}

/// Pre-flight probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Wall-clock limit for the whole probe invocation
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Media duration the probe reads before exiting (`-t`)
    #[serde(default = "default_probe_duration")]
    pub duration_secs: u64,

    /// URL schemes accepted as stream sources
    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_duration() -> u64 {
    1
}

fn default_allowed_schemes() -> Vec<String> {
    vec!["rtsp".to_string(), "rtsps".to_string()]
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            duration_secs: default_probe_duration(),
            allowed_schemes: default_allowed_schemes(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Readiness polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// How long a new session may take to produce its first output
    #[serde(default = "default_ready_timeout")]
    pub timeout_secs: u64,

    /// Delay between filesystem checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_ready_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Process registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Sessions older than this are reaped even if stop was never called
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Interval of the expiry reaper
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Directory for durable process records; unset keeps the registry in memory only
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_session_ttl() -> u64 {
    3600 // 1 hour
}

fn default_reap_interval() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            reap_interval_secs: default_reap_interval(),
            state_dir: None,
        }
    }
}

impl RegistryConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Topic name stream updates are broadcast on
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Broadcast buffer; slower subscribers lag past this
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_topic() -> String {
    "streams".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Load configuration from file if it exists, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(
                    path = %p.as_ref().display(),
                    "Config file not found, using defaults"
                );
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("GATEWAY_HTTP_PORT") {
            self.server.http_port = port;
        }
        if let Ok(url) = std::env::var("GATEWAY_PUBLIC_BASE_URL") {
            self.server.public_base_url = url;
        }
        if let Ok(root) = std::env::var("GATEWAY_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(binary) = std::env::var("GATEWAY_FFMPEG") {
            self.transcoder.binary = binary;
        }
        if let Some(secs) = env_parse("GATEWAY_PROBE_TIMEOUT") {
            self.probe.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("GATEWAY_READY_TIMEOUT") {
            self.readiness.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("GATEWAY_SESSION_TTL") {
            self.registry.session_ttl_secs = secs;
        }
        if let Ok(dir) = std::env::var("GATEWAY_STATE_DIR") {
            self.registry.state_dir = Some(PathBuf::from(dir));
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
