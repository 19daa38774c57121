use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::normalize::MetricCategory;

const DEFAULT_CONFIG_PATH: &str = "/config/pgdash.yaml";

static HOST_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]{0,252})$").expect("static host pattern compiles")
});

static UNIX_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.@-]{0,63}$").expect("static name pattern compiles")
});

/// Top-level configuration for the pgdash service.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub cluster: String,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub admin_dsn: String,
    #[serde(default)]
    pub sample_intervals: SampleIntervals,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub notifiers: Notifiers,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cluster: "local".into(),
            dsn: String::new(),
            admin_dsn: String::new(),
            sample_intervals: SampleIntervals::default(),
            limits: Limits::default(),
            thresholds: Thresholds::default(),
            alerts: AlertSettings::default(),
            notifiers: Notifiers::default(),
            http: HttpConfig::default(),
            security: SecurityConfig::default(),
            timeouts: Timeouts::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Loop schedule configuration (with friendly duration parsing).
#[derive(Debug, Clone, Deserialize)]
pub struct SampleIntervals {
    /// Threshold watch loop (host metrics, connection headroom).
    #[serde(
        default = "SampleIntervals::default_threshold_watch",
        with = "humantime_serde"
    )]
    pub threshold_watch: Duration,
}

impl SampleIntervals {
    const fn default_threshold_watch() -> Duration {
        Duration::from_secs(60)
    }
}

impl Default for SampleIntervals {
    fn default() -> Self {
        Self {
            threshold_watch: Self::default_threshold_watch(),
        }
    }
}

/// Limits that keep snapshot size bounded.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Maximum entries per activity list in a snapshot.
    #[serde(default = "Limits::default_top_n")]
    pub top_n: u32,
    /// Host metric rows read for the trend section.
    #[serde(default = "Limits::default_history_rows")]
    pub history_rows: u32,
    #[serde(default = "Limits::default_backup_rows")]
    pub backup_rows: u32,
    #[serde(default = "Limits::default_high_cpu_rows")]
    pub high_cpu_rows: u32,
    /// Samples per rolling average.
    #[serde(default = "Limits::default_rolling_window")]
    pub rolling_window: usize,
    #[serde(
        default = "Limits::default_slow_query_age",
        with = "humantime_serde"
    )]
    pub slow_query_age: Duration,
    #[serde(
        default = "Limits::default_idle_session_age",
        with = "humantime_serde"
    )]
    pub idle_session_age: Duration,
    /// Newest host metrics row older than this counts as stale.
    #[serde(
        default = "Limits::default_host_metrics_max_age",
        with = "humantime_serde"
    )]
    pub host_metrics_max_age: Duration,
    /// Restrict bloat and size listings to one schema.
    #[serde(default)]
    pub table_schema: Option<String>,
}

impl Limits {
    const fn default_top_n() -> u32 {
        20
    }

    const fn default_history_rows() -> u32 {
        30
    }

    const fn default_backup_rows() -> u32 {
        10
    }

    const fn default_high_cpu_rows() -> u32 {
        200
    }

    const fn default_rolling_window() -> usize {
        5
    }

    const fn default_slow_query_age() -> Duration {
        Duration::from_secs(15 * 60)
    }

    const fn default_idle_session_age() -> Duration {
        Duration::from_secs(60 * 60)
    }

    const fn default_host_metrics_max_age() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            top_n: Self::default_top_n(),
            history_rows: Self::default_history_rows(),
            backup_rows: Self::default_backup_rows(),
            high_cpu_rows: Self::default_high_cpu_rows(),
            rolling_window: Self::default_rolling_window(),
            slow_query_age: Self::default_slow_query_age(),
            idle_session_age: Self::default_idle_session_age(),
            host_metrics_max_age: Self::default_host_metrics_max_age(),
            table_schema: None,
        }
    }
}

/// Which side of the limit counts as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    WarnAtOrAbove,
    WarnAtOrBelow,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ThresholdRule {
    pub limit: f64,
    pub direction: Direction,
}

impl ThresholdRule {
    pub const fn above(limit: f64) -> Self {
        Self {
            limit,
            direction: Direction::WarnAtOrAbove,
        }
    }

    pub const fn below(limit: f64) -> Self {
        Self {
            limit,
            direction: Direction::WarnAtOrBelow,
        }
    }

    pub fn is_warn(&self, value: f64) -> bool {
        match self.direction {
            Direction::WarnAtOrAbove => value >= self.limit,
            Direction::WarnAtOrBelow => value <= self.limit,
        }
    }
}

/// Per-category status thresholds. A category set to `null` has no rule.
#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    #[serde(default = "Thresholds::default_cpu_usage")]
    pub cpu_usage: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_ram_usage")]
    pub ram_usage: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_cache_usage")]
    pub cache_usage: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_disk_usage")]
    pub disk_usage: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_cpu_load1")]
    pub cpu_load1: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_cpu_load5")]
    pub cpu_load5: Option<ThresholdRule>,
    /// Applies to connection headroom (percent of max_connections still free).
    #[serde(default = "Thresholds::default_connection_load")]
    pub connection_load: Option<ThresholdRule>,
    #[serde(default = "Thresholds::default_cache_hit_ratio")]
    pub cache_hit_ratio: Option<ThresholdRule>,
    #[serde(default)]
    pub transactions_per_second: Option<ThresholdRule>,
    #[serde(default)]
    pub backup_size_delta: Option<ThresholdRule>,
}

impl Thresholds {
    const fn default_cpu_usage() -> Option<ThresholdRule> {
        Some(ThresholdRule::above(95.0))
    }

    const fn default_ram_usage() -> Option<ThresholdRule> {
        Some(ThresholdRule::above(90.0))
    }

    const fn default_cache_usage() -> Option<ThresholdRule> {
        Some(ThresholdRule::below(85.0))
    }

    const fn default_disk_usage() -> Option<ThresholdRule> {
        Some(ThresholdRule::above(90.0))
    }

    const fn default_cpu_load1() -> Option<ThresholdRule> {
        Some(ThresholdRule::above(10.0))
    }

    const fn default_cpu_load5() -> Option<ThresholdRule> {
        Some(ThresholdRule::above(15.0))
    }

    const fn default_connection_load() -> Option<ThresholdRule> {
        Some(ThresholdRule::below(10.0))
    }

    const fn default_cache_hit_ratio() -> Option<ThresholdRule> {
        Some(ThresholdRule::below(90.0))
    }

    pub fn rule(&self, category: MetricCategory) -> Option<&ThresholdRule> {
        match category {
            MetricCategory::CpuUsage => self.cpu_usage.as_ref(),
            MetricCategory::RamUsage => self.ram_usage.as_ref(),
            MetricCategory::CacheUsage => self.cache_usage.as_ref(),
            MetricCategory::DiskUsage => self.disk_usage.as_ref(),
            MetricCategory::CpuLoad1 => self.cpu_load1.as_ref(),
            MetricCategory::CpuLoad5 => self.cpu_load5.as_ref(),
            MetricCategory::ConnectionLoad => self.connection_load.as_ref(),
            MetricCategory::CacheHitRatio => self.cache_hit_ratio.as_ref(),
            MetricCategory::TransactionsPerSecond => self.transactions_per_second.as_ref(),
            MetricCategory::BackupSizeDelta => self.backup_size_delta.as_ref(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_usage: Self::default_cpu_usage(),
            ram_usage: Self::default_ram_usage(),
            cache_usage: Self::default_cache_usage(),
            disk_usage: Self::default_disk_usage(),
            cpu_load1: Self::default_cpu_load1(),
            cpu_load5: Self::default_cpu_load5(),
            connection_load: Self::default_connection_load(),
            cache_hit_ratio: Self::default_cache_hit_ratio(),
            transactions_per_second: None,
            backup_size_delta: None,
        }
    }
}

/// When a persistent warning becomes a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "AlertSettings::default_persist_cycles")]
    pub persist_cycles: u32,
    #[serde(default = "default_true")]
    pub notify_on_maintenance_failure: bool,
}

impl AlertSettings {
    const fn default_persist_cycles() -> u32 {
        3
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            persist_cycles: Self::default_persist_cycles(),
            notify_on_maintenance_failure: true,
        }
    }
}

/// Optional notifier configuration. Without a webhook, notifications are logged.
#[derive(Debug, Clone, Deserialize)]
pub struct Notifiers {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(
        default = "Notifiers::default_webhook_timeout",
        with = "humantime_serde"
    )]
    pub webhook_timeout: Duration,
}

impl Notifiers {
    const fn default_webhook_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for Notifiers {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout: Self::default_webhook_timeout(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8181".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Security guardrails enforced by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub read_only_enforce: bool,
    #[serde(default)]
    pub redact_sql_text: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            read_only_enforce: true,
            redact_sql_text: false,
        }
    }
}

/// Session timeouts plus per-probe and per-step deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "Timeouts::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "Timeouts::default_probe", with = "humantime_serde")]
    pub probe: Duration,
    #[serde(
        default = "Timeouts::default_maintenance_step",
        with = "humantime_serde"
    )]
    pub maintenance_step: Duration,
    #[serde(default = "Timeouts::default_remote_exec", with = "humantime_serde")]
    pub remote_exec: Duration,
}

impl Timeouts {
    const fn default_statement_timeout_ms() -> u64 {
        3_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        1_000
    }

    const fn default_probe() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_maintenance_step() -> Duration {
        Duration::from_secs(600)
    }

    const fn default_remote_exec() -> Duration {
        Duration::from_secs(120)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            probe: Self::default_probe(),
            maintenance_step: Self::default_maintenance_step(),
            remote_exec: Self::default_remote_exec(),
        }
    }
}

/// Remote restart channel. Only hosts listed here may be restarted.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "RemoteConfig::default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "RemoteConfig::default_service")]
    pub service: String,
    #[serde(default = "RemoteConfig::default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "RemoteConfig::default_connect_timeout_s")]
    pub connect_timeout_s: u32,
}

impl RemoteConfig {
    fn default_ssh_user() -> String {
        "postgres".to_string()
    }

    fn default_service() -> String {
        "postgresql-14".to_string()
    }

    fn default_ssh_binary() -> String {
        "ssh".to_string()
    }

    const fn default_connect_timeout_s() -> u32 {
        10
    }

    pub fn allows(&self, host: &str) -> bool {
        self.hosts.iter().any(|allowed| allowed == host)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            ssh_user: Self::default_ssh_user(),
            service: Self::default_service(),
            ssh_binary: Self::default_ssh_binary(),
            connect_timeout_s: Self::default_connect_timeout_s(),
        }
    }
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGDASH_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    ensure_required_secrets(&config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = parse_yaml(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

pub fn parse_yaml(raw: &str) -> Result<AppConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() || !config.admin_dsn.trim().is_empty() {
        bail!(
            "Remove `dsn`/`admin_dsn` from pgdash YAML config; set PGDASH_DSN and PGDASH_ADMIN_DSN in the environment instead."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(cluster) = env::var("PGDASH_CLUSTER") {
        if !cluster.is_empty() {
            config.cluster = cluster;
        }
    }

    if let Some(dsn) = read_secret("PGDASH_DSN")? {
        config.dsn = dsn;
    }
    if let Some(dsn) = read_secret("PGDASH_ADMIN_DSN")? {
        config.admin_dsn = dsn;
    }

    Ok(())
}

fn read_secret(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) => {
            if value.trim().is_empty() {
                bail!("Environment variable {name} is set but empty; populate it in your .env file.");
            }
            Ok(Some(value))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.dsn.trim().is_empty() {
        bail!(
            "Missing Postgres DSN. Set the PGDASH_DSN environment variable. Secrets must not be stored in YAML."
        );
    }
    Ok(())
}

/// Reject values that would later be interpolated into the restart command line.
pub fn validate(config: &AppConfig) -> Result<()> {
    let remote = &config.remote;
    for host in &remote.hosts {
        if !HOST_NAME.is_match(host) {
            bail!("remote.hosts entry {host:?} is not a plain host name");
        }
    }
    if !UNIX_NAME.is_match(&remote.ssh_user) {
        bail!("remote.ssh_user {:?} is not a valid user name", remote.ssh_user);
    }
    if !UNIX_NAME.is_match(&remote.service) {
        bail!("remote.service {:?} is not a valid unit name", remote.service);
    }
    if config.limits.top_n == 0 {
        bail!("limits.top_n must be at least 1");
    }
    if config.limits.rolling_window == 0 {
        bail!("limits.rolling_window must be at least 1");
    }
    if config.limits.host_metrics_max_age.is_zero() {
        bail!("limits.host_metrics_max_age must be greater than zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse_yaml("cluster: prod\n").expect("parse");
        assert_eq!(config.cluster, "prod");
        assert_eq!(config.limits.top_n, 20);
        assert_eq!(config.timeouts.probe, Duration::from_secs(5));
        assert_eq!(config.limits.host_metrics_max_age, Duration::from_secs(900));
        assert_eq!(
            config.thresholds.rule(MetricCategory::CpuUsage),
            Some(&ThresholdRule::above(95.0))
        );
        assert!(config.thresholds.rule(MetricCategory::BackupSizeDelta).is_none());
    }

    #[test]
    fn thresholds_and_durations_parse() {
        let raw = r#"
cluster: prod
limits:
  top_n: 50
  slow_query_age: 5m
  host_metrics_max_age: 2m
thresholds:
  cache_usage:
    limit: 70
    direction: warn_at_or_below
  cpu_usage: null
remote:
  hosts: [db1.internal]
"#;
        let config = parse_yaml(raw).expect("parse");
        assert_eq!(config.limits.top_n, 50);
        assert_eq!(config.limits.slow_query_age, Duration::from_secs(300));
        assert_eq!(config.limits.host_metrics_max_age, Duration::from_secs(120));
        assert!(config.thresholds.cpu_usage.is_none());
        let cache = config.thresholds.rule(MetricCategory::CacheUsage).expect("rule");
        assert!(cache.is_warn(70.0));
        assert!(!cache.is_warn(70.5));
        assert!(config.remote.allows("db1.internal"));
        assert!(!config.remote.allows("db2.internal"));
        validate(&config).expect("valid");
    }

    #[test]
    fn dsn_in_yaml_is_refused() {
        let config = parse_yaml("cluster: prod\ndsn: postgres://x\n").expect("parse");
        assert!(enforce_yaml_policy(&config).is_err());
    }

    #[test]
    fn shell_metacharacters_in_remote_settings_are_refused() {
        let mut config = AppConfig::default();
        config.remote.hosts = vec!["db1; rm -rf /".into()];
        assert!(validate(&config).is_err());

        let mut config = AppConfig::default();
        config.remote.service = "postgresql && reboot".into();
        assert!(validate(&config).is_err());
    }
}
