use crate::codec::{parse_key, LinkCodec, DEFAULT_KEY};
use crate::frame::FrameLayout;
use crate::geo::{GeoBounds, GeoFilter, GeoPolicy};
use crate::ingest::{IngestSettings, LinkMode};
use crate::mqtt::MqttSettings;
use crate::session::SessionSettings;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/launch-sidecar/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("LAUNCH_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    bus_channel: Option<String>,
    #[serde(default)]
    admin_key: Option<String>,
    #[serde(default)]
    id_api_url: Option<String>,
    #[serde(default)]
    serial_port: Option<String>,
    #[serde(default)]
    baudrate: Option<u32>,
    #[serde(default)]
    end_timeout_secs: Option<u64>,
    #[serde(default)]
    geo_policy: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "launch-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "launch-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn apply_setup_overrides<V>(config: &mut Config, overrides: &SetupConfigOverrides, var: &V)
where
    V: Fn(&str) -> Option<String>,
{
    let env_allows = |key: &str| non_empty(var(key).as_deref()).is_none();

    if env_allows("LAUNCH_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("LAUNCH_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("LAUNCH_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("LAUNCH_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("LAUNCH_BUS_CHANNEL") {
        if let Some(channel) = non_empty(overrides.bus_channel.as_deref()) {
            config.bus_channel = channel;
        }
    }
    if env_allows("LAUNCH_ID_API_URL") {
        if let Some(url) = non_empty(overrides.id_api_url.as_deref()) {
            config.id_api_url = Some(url);
        }
    }
    if env_allows("LAUNCH_SERIAL_PORT") {
        if let Some(port) = non_empty(overrides.serial_port.as_deref()) {
            config.serial_port = port;
        }
    }
    if env_allows("LAUNCH_BAUDRATE") {
        if let Some(baudrate) = overrides.baudrate.filter(|v| *v != 0) {
            config.baudrate = baudrate;
        }
    }
    if env_allows("LAUNCH_END_TIMEOUT_SECS") {
        if let Some(value) = overrides.end_timeout_secs.filter(|v| *v != 0) {
            config.end_timeout_secs = value;
        }
    }
    if env_allows("LAUNCH_GEO_POLICY") {
        if let Some(raw) = non_empty(overrides.geo_policy.as_deref()) {
            match raw.parse::<GeoPolicy>() {
                Ok(policy) => config.geo_policy = policy,
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring geo_policy from setup config")
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub serial_port: String,
    pub baudrate: u32,
    pub link_read_timeout_ms: u64,
    pub link_mode: LinkMode,
    pub link_codec: LinkCodec,
    pub frame_layout: FrameLayout,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub bus_channel: String,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub admin_key: String,
    pub id_api_url: Option<String>,
    pub geo_bounds: GeoBounds,
    pub geo_policy: GeoPolicy,
    pub end_timeout_secs: u64,
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides(&setup_config_path());
        Self::from_vars(|key| env::var(key).ok(), overrides.as_ref())
    }

    fn from_vars<V>(var: V, overrides: Option<&SetupConfigOverrides>) -> Result<Self>
    where
        V: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| non_empty(var(key).as_deref());

        let admin_key = text("LAUNCH_ADMIN_KEY")
            .or_else(|| overrides.and_then(|ov| non_empty(ov.admin_key.as_deref())))
            .context("LAUNCH_ADMIN_KEY is required (or present as admin_key in the setup config)")?;

        let database_url = text("LAUNCH_DATABASE_URL")
            .or_else(|| text("DATABASE_URL"))
            .or_else(|| overrides.and_then(|ov| non_empty(ov.database_url.as_deref())))
            .map(normalize_database_url);

        let cipher_key = match text("LAUNCH_LINK_CIPHER_KEY") {
            Some(raw) => parse_key(&raw)
                .map_err(|err| anyhow!(err))
                .context("invalid LAUNCH_LINK_CIPHER_KEY")?,
            None => DEFAULT_KEY,
        };
        let link_codec = LinkCodec::from_config(
            &text("LAUNCH_LINK_CIPHER").unwrap_or_else(|| "xor".to_string()),
            cipher_key,
        )
        .map_err(|err| anyhow!(err))
        .context("invalid LAUNCH_LINK_CIPHER")?;

        let link_mode = parse_choice(text("LAUNCH_LINK_MODE"), LinkMode::Listen)
            .context("invalid LAUNCH_LINK_MODE")?;
        let frame_layout = parse_choice(text("LAUNCH_FRAME_LAYOUT"), FrameLayout::Star)
            .context("invalid LAUNCH_FRAME_LAYOUT")?;
        let geo_policy = parse_choice(text("LAUNCH_GEO_POLICY"), GeoPolicy::NullFields)
            .context("invalid LAUNCH_GEO_POLICY")?;

        let defaults = GeoBounds::default();
        let geo_bounds = GeoBounds {
            min_lat: parse_or(text("LAUNCH_GEO_MIN_LAT"), defaults.min_lat),
            max_lat: parse_or(text("LAUNCH_GEO_MAX_LAT"), defaults.max_lat),
            min_lon: parse_or(text("LAUNCH_GEO_MIN_LON"), defaults.min_lon),
            max_lon: parse_or(text("LAUNCH_GEO_MAX_LON"), defaults.max_lon),
            max_alt: parse_or(text("LAUNCH_GEO_MAX_ALT"), defaults.max_alt),
        };

        let mut config = Self {
            serial_port: text("LAUNCH_SERIAL_PORT").unwrap_or_else(|| "/dev/ttyUSB0".to_string()),
            baudrate: parse_or(text("LAUNCH_BAUDRATE"), 9600),
            link_read_timeout_ms: parse_or(text("LAUNCH_LINK_READ_TIMEOUT_MS"), 1000),
            link_mode,
            link_codec,
            frame_layout,
            mqtt_host: text("LAUNCH_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: parse_or(text("LAUNCH_MQTT_PORT"), 1883),
            mqtt_username: text("LAUNCH_MQTT_USERNAME"),
            mqtt_password: text("LAUNCH_MQTT_PASSWORD"),
            mqtt_keepalive_secs: parse_or(text("LAUNCH_MQTT_KEEPALIVE_SECS"), 30),
            mqtt_client_id: text("LAUNCH_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("launch-sidecar-{}", std::process::id())),
            bus_channel: text("LAUNCH_BUS_CHANNEL")
                .unwrap_or_else(|| "cansat/telemetry".to_string()),
            database_url,
            db_pool_size: parse_or(text("LAUNCH_DB_POOL_SIZE"), 5),
            admin_key,
            id_api_url: text("LAUNCH_ID_API_URL"),
            geo_bounds,
            geo_policy,
            end_timeout_secs: parse_or(text("LAUNCH_END_TIMEOUT_SECS"), 20),
            tick_interval_ms: parse_or(text("LAUNCH_TICK_INTERVAL_MS"), 1000),
            poll_interval_ms: parse_or(text("LAUNCH_POLL_INTERVAL_MS"), 1000),
            otlp_endpoint: text("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = overrides {
            apply_setup_overrides(&mut config, overrides, &var);
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn end_timeout(&self) -> Duration {
        Duration::from_secs(self.end_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn link_read_timeout(&self) -> Duration {
        Duration::from_millis(self.link_read_timeout_ms)
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url.as_deref().context(
            "LAUNCH_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)",
        )
    }

    /// Each process connects with its own client id; the broker drops the
    /// older connection when two clients share one.
    pub fn mqtt_settings(&self, role: &str) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keepalive: self.mqtt_keepalive(),
            client_id: format!("{}-{role}", self.mqtt_client_id),
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            admin_key: self.admin_key.clone(),
            layout: self.frame_layout,
            codec: self.link_codec,
            mode: self.link_mode,
            read_timeout: self.link_read_timeout(),
            poll_interval: self.poll_interval(),
            channel: self.bus_channel.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            admin_key: self.admin_key.clone(),
            geo: GeoFilter::new(self.geo_bounds, self.geo_policy),
            end_timeout: self.end_timeout(),
            tick_interval: self.tick_interval(),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn parse_choice<T>(raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr<Err = String>,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|err| anyhow!(err)),
        None => Ok(default),
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
