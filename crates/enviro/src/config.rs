//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    /// Seconds between publishes.
    pub period: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u64,
    pub connect_timeout: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 1883,
            topic: "enviroplus".into(),
            period: 5,
            username: None,
            password: None,
            keep_alive: 30,
            connect_timeout: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConfig {
    /// Seconds between inserts.  Shared by the local and remote store.
    pub period: u64,
    pub local_path: PathBuf,
    /// Remote PostgreSQL host.  The remote store is disabled when unset.
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    pub table: String,
    /// Upper bound, in seconds, on each remote connect and insert.
    pub timeout: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            period: 60,
            local_path: PathBuf::from("enviro.db"),
            host: None,
            port: 5432,
            user: String::new(),
            password: String::new(),
            db: String::new(),
            table: "enviro_plus".into(),
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sim,
    Iio,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    pub tick_ms: u64,
    /// Warm-up seconds after start before anything is delivered.
    pub start_delay: u64,
    /// Seconds between clock guard re-checks.
    pub clock_guard_interval: u64,
    pub comp_factor: f64,
    pub backend: Backend,
    pub particulate: bool,
    pub pms_device: String,
    pub pms_reset_pin: u8,
    pub pms_enable_pin: u8,
    pub iio: IioConfig,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            start_delay: 0,
            clock_guard_interval: 10,
            comp_factor: 2.3,
            backend: Backend::Sim,
            particulate: false,
            pms_device: "/dev/ttyAMA0".into(),
            pms_reset_pin: 27,
            pms_enable_pin: 22,
            iio: IioConfig::default(),
        }
    }
}

/// One sysfs attribute and the factor that turns its integer/float content
/// into the unit the reading uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IioChannel {
    pub path: PathBuf,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl IioChannel {
    fn new(path: &str, scale: f64) -> Self {
        Self {
            path: PathBuf::from(path),
            scale,
        }
    }
}

/// Sysfs sources for the `iio` backend.  Defaults match the kernel bmp280,
/// ltr501 and ads1015 drivers enumerated in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IioConfig {
    /// °C
    pub temperature: IioChannel,
    /// hPa
    pub pressure: IioChannel,
    /// %RH
    pub humidity: IioChannel,
    /// Gas heater divider voltages in volts; converted to sensor
    /// resistance by the backend.
    pub oxidising: IioChannel,
    pub reducing: IioChannel,
    pub nh3: IioChannel,
    pub lux: IioChannel,
}

impl Default for IioConfig {
    fn default() -> Self {
        const BME: &str = "/sys/bus/iio/devices/iio:device0";
        const LTR: &str = "/sys/bus/iio/devices/iio:device1";
        const ADS: &str = "/sys/bus/iio/devices/iio:device2";
        Self {
            temperature: IioChannel::new(&format!("{BME}/in_temp_input"), 0.001),
            pressure: IioChannel::new(&format!("{BME}/in_pressure_input"), 10.0),
            humidity: IioChannel::new(&format!("{BME}/in_humidityrelative_input"), 0.001),
            oxidising: IioChannel::new(&format!("{ADS}/in_voltage0_raw"), 0.002),
            reducing: IioChannel::new(&format!("{ADS}/in_voltage1_raw"), 0.002),
            nh3: IioChannel::new(&format!("{ADS}/in_voltage2_raw"), 0.002),
            lux: IioChannel::new(&format!("{LTR}/in_illuminance_input"), 1.0),
        }
    }
}

impl IioConfig {
    fn channels(&self) -> [(&'static str, &IioChannel); 7] {
        [
            ("temperature", &self.temperature),
            ("pressure", &self.pressure),
            ("humidity", &self.humidity),
            ("oxidising", &self.oxidising),
            ("reducing", &self.reducing),
            ("nh3", &self.nh3),
            ("lux", &self.lux),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Append log lines here instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl MqttConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
}

impl DbConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    pub fn remote_enabled(&self) -> bool {
        self.host.is_some()
    }
}

impl SamplingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay)
    }

    pub fn clock_guard_interval(&self) -> Duration {
        Duration::from_secs(self.clock_guard_interval)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Plain SQL identifier: letters, digits and underscores, not starting with
/// a digit.  The remote table name is spliced into the INSERT text.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_db(&mut errors);
        self.validate_sampling(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if !m.enabled {
            return;
        }

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.topic.trim().is_empty() {
            errors.push("mqtt.topic is empty".into());
        } else if m.topic.contains(['+', '#']) {
            errors.push(format!(
                "mqtt.topic '{}' must not contain wildcards",
                m.topic
            ));
        }
        if m.period == 0 {
            errors.push("mqtt.period must be positive".into());
        }
        if m.connect_timeout == 0 {
            errors.push("mqtt.connect_timeout must be positive".into());
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".into());
        }
    }

    fn validate_db(&self, errors: &mut Vec<String>) {
        let d = &self.db;

        if d.period == 0 {
            errors.push("db.period must be positive".into());
        }
        if d.local_path.as_os_str().is_empty() {
            errors.push("db.local_path is empty".into());
        }

        // ── Remote store (only when a host is configured) ───────
        let Some(host) = &d.host else {
            return;
        };
        if host.trim().is_empty() {
            errors.push("db.host is empty (omit it to disable the remote store)".into());
        }
        if d.user.trim().is_empty() {
            errors.push("db.user is required when db.host is set".into());
        }
        if d.db.trim().is_empty() {
            errors.push("db.db is required when db.host is set".into());
        }
        if !is_sql_identifier(&d.table) {
            errors.push(format!(
                "db.table '{}' is not a plain SQL identifier",
                d.table
            ));
        }
        if d.timeout == 0 {
            errors.push("db.timeout must be positive".into());
        }
    }

    fn validate_sampling(&self, errors: &mut Vec<String>) {
        let s = &self.sampling;

        if s.tick_ms == 0 {
            errors.push("sampling.tick_ms must be positive".into());
        }
        if s.clock_guard_interval == 0 {
            errors.push("sampling.clock_guard_interval must be positive".into());
        }
        if !(s.comp_factor.is_finite() && s.comp_factor > 0.0) {
            errors.push(format!(
                "sampling.comp_factor must be a positive number, got {}",
                s.comp_factor
            ));
        }

        if s.backend == Backend::Sim && !cfg!(feature = "sim") {
            errors.push("sampling.backend = \"sim\" needs the `sim` feature".into());
        }
        if s.particulate && !cfg!(feature = "hw") {
            errors.push("sampling.particulate needs the `hw` feature".into());
        }

        if s.backend == Backend::Iio {
            for (name, ch) in s.iio.channels() {
                if ch.path.as_os_str().is_empty() {
                    errors.push(format!("sampling.iio.{name}.path is empty"));
                }
                if !(ch.scale.is_finite() && ch.scale != 0.0) {
                    errors.push(format!(
                        "sampling.iio.{name}.scale must be finite and non-zero, got {}",
                        ch.scale
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn remote_config() -> Config {
        let mut cfg = Config::default();
        cfg.db.host = Some("db.lan".into());
        cfg.db.user = "enviro".into();
        cfg.db.db = "telemetry".into();
        cfg
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[mqtt]
host = "broker.lan"
port = 1884
topic = "enviro"
period = 1
username = "pi"
password = "secret"

[db]
period = 60
local_path = "/var/lib/enviro/enviro.db"
host = "db.lan"
user = "enviro"
password = "pw"
db = "telemetry"

[sampling]
start_delay = 1200
comp_factor = 3.2
backend = "iio"

[sampling.iio]
lux = { path = "/sys/bus/iio/devices/iio:device3/in_illuminance_input" }

[log]
level = "debug"
file = "enviroplus-mqtt.log"
"#;
        let cfg = parse(toml_str).unwrap();
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.period(), Duration::from_secs(1));
        assert_eq!(cfg.db.period(), Duration::from_secs(60));
        assert_eq!(cfg.db.table, "enviro_plus");
        assert!(cfg.db.remote_enabled());
        assert_eq!(cfg.sampling.start_delay(), Duration::from_secs(1200));
        assert_eq!(cfg.sampling.comp_factor, 3.2);
        assert_eq!(cfg.sampling.backend, Backend::Iio);
        assert_eq!(cfg.sampling.iio.lux.scale, 1.0);
        assert!(cfg
            .sampling
            .iio
            .lux
            .path
            .ends_with("iio:device3/in_illuminance_input"));
        // untouched channels keep their defaults
        assert_eq!(cfg.sampling.iio.temperature.scale, 0.001);
        assert_eq!(cfg.log.file, Some(PathBuf::from("enviroplus-mqtt.log")));
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert!(cfg.mqtt.enabled);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.sampling.tick(), Duration::from_millis(10));
        assert_eq!(cfg.sampling.clock_guard_interval(), Duration::from_secs(10));
        assert_eq!(cfg.sampling.start_delay(), Duration::ZERO);
        assert!(!cfg.db.remote_enabled());
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn parse_rejects_unknown_keys() {
        assert!(parse("[mqtt]\nhots = \"typo\"\n").is_err());
    }

    #[test]
    fn parse_rejects_unknown_backend() {
        assert!(parse("[sampling]\nbackend = \"spi\"\n").is_err());
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/enviro.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    // -- MQTT ---------------------------------------------------------------

    #[test]
    fn mqtt_zero_period_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.period = 0;
        assert_validation_err(&cfg, "mqtt.period must be positive");
    }

    #[test]
    fn mqtt_wildcard_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic = "enviro/#".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn mqtt_password_without_username_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.password = Some("pw".into());
        assert_validation_err(&cfg, "without mqtt.username");
    }

    #[test]
    fn mqtt_disabled_skips_checks() {
        let mut cfg = Config::default();
        cfg.mqtt.enabled = false;
        cfg.mqtt.host = String::new();
        cfg.mqtt.period = 0;
        assert!(cfg.validate().is_ok());
    }

    // -- DB -----------------------------------------------------------------

    #[test]
    fn db_zero_period_rejected() {
        let mut cfg = Config::default();
        cfg.db.period = 0;
        assert_validation_err(&cfg, "db.period must be positive");
    }

    #[test]
    fn remote_requires_user_and_db() {
        let mut cfg = Config::default();
        cfg.db.host = Some("db.lan".into());
        assert_validation_err(&cfg, "db.user is required");
        assert_validation_err(&cfg, "db.db is required");
    }

    #[test]
    fn remote_table_must_be_identifier() {
        let mut cfg = remote_config();
        cfg.db.table = "enviro; DROP TABLE enviro".into();
        assert_validation_err(&cfg, "not a plain SQL identifier");
    }

    #[test]
    fn remote_valid_config_accepted() {
        assert!(remote_config().validate().is_ok());
    }

    #[test]
    fn sql_identifier_rules() {
        assert!(is_sql_identifier("enviro_plus"));
        assert!(is_sql_identifier("_t1"));
        assert!(!is_sql_identifier("1enviro"));
        assert!(!is_sql_identifier("enviro-plus"));
        assert!(!is_sql_identifier(""));
    }

    // -- Sampling -------------------------------------------------------------

    #[test]
    fn comp_factor_must_be_positive() {
        let mut cfg = Config::default();
        cfg.sampling.comp_factor = 0.0;
        assert_validation_err(&cfg, "comp_factor must be a positive number");
        cfg.sampling.comp_factor = f64::NAN;
        assert_validation_err(&cfg, "comp_factor must be a positive number");
    }

    #[test]
    fn tick_zero_rejected() {
        let mut cfg = Config::default();
        cfg.sampling.tick_ms = 0;
        assert_validation_err(&cfg, "sampling.tick_ms must be positive");
    }

    #[test]
    fn iio_zero_scale_rejected() {
        let mut cfg = Config::default();
        cfg.sampling.backend = Backend::Iio;
        cfg.sampling.iio.nh3.scale = 0.0;
        assert_validation_err(&cfg, "sampling.iio.nh3.scale");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.period = 0;
        cfg.db.period = 0;
        cfg.sampling.tick_ms = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    #[test]
    fn sample_config_file_parses() {
        let cfg = parse(include_str!("../enviro.toml")).unwrap();
        assert_eq!(cfg.mqtt.topic, "enviroplus");
        assert_eq!(cfg.db.table, "enviro_plus");
        assert!(!cfg.db.remote_enabled());
        assert_eq!(cfg.sampling.comp_factor, 2.3);
    }
}
