use crate::scanner::{ScanOptions, ADB_PORT, BULK_PROBE_TIMEOUT, CONNECT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the adb binary
const ENV_ADB: &str = "SKYBOX_ADB";

/// Environment variable overriding the config file location
const ENV_CONFIG: &str = "SKYBOX_CONFIG";

/// Serial number prefix for the supported box model; the MAC completes it.
pub const DEFAULT_SN_HEAD: &str = "00570300004221C02117";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    adb: Option<AdbSection>,
    scan: Option<ScanSection>,
    provision: Option<ProvisionSection>,
}

#[derive(Debug, Deserialize, Default)]
struct AdbSection {
    binary: Option<String>,
    port: Option<u16>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ScanSection {
    probe_timeout_ms: Option<u64>,
    start_octet: Option<u8>,
    end_octet: Option<u8>,
    max_concurrency: Option<usize>,
    deadline_ms: Option<u64>,
    local_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Deserialize, Default)]
struct ProvisionSection {
    sn_head: Option<String>,
    manufacturer: Option<String>,
    pppoe_suffix: Option<String>,
    pppoe_password: Option<String>,
    reset_settle_secs: Option<u64>,
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// At least one value came from an environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdbConfig {
    pub binary: String,
    pub port: u16,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanConfig {
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    pub start_octet: u8,
    pub end_octet: u8,
    pub max_concurrency: usize,
    #[serde(with = "opt_millis")]
    pub deadline: Option<Duration>,
    pub local_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionConfig {
    pub sn_head: String,
    pub manufacturer: String,
    pub pppoe_suffix: String,
    pub pppoe_password: String,
    pub reset_settle_secs: u64,
}

/// Effective runtime configuration
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub adb: AdbConfig,
    pub scan: ScanConfig,
    pub provision: ProvisionConfig,
    pub source: ConfigSource,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            adb: AdbConfig {
                binary: "adb".to_string(),
                port: ADB_PORT,
                connect_timeout: CONNECT_TIMEOUT,
            },
            scan: ScanConfig {
                probe_timeout: BULK_PROBE_TIMEOUT,
                start_octet: 1,
                end_octet: 255,
                max_concurrency: 256,
                deadline: None,
                local_ip: None,
            },
            provision: ProvisionConfig {
                sn_head: DEFAULT_SN_HEAD.to_string(),
                manufacturer: "SKYWORTH".to_string(),
                pppoe_suffix: "ottx01@ottx".to_string(),
                pppoe_password: "123456".to_string(),
                reset_settle_secs: 70,
            },
            source: ConfigSource::Default,
        }
    }
}

impl AgentConfig {
    /// Scanner options for a bulk sweep on the configured adb port.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            port: self.adb.port,
            probe_timeout: self.scan.probe_timeout,
            max_concurrency: self.scan.max_concurrency,
            deadline: self.scan.deadline,
            local_ip: self.scan.local_ip,
            ..ScanOptions::default()
        }
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(adb) = file.adb {
            if let Some(binary) = adb.binary.filter(|b| !b.trim().is_empty()) {
                self.adb.binary = binary;
            }
            if let Some(port) = adb.port {
                self.adb.port = port;
            }
            if let Some(ms) = adb.connect_timeout_ms {
                self.adb.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(scan) = file.scan {
            if let Some(ms) = scan.probe_timeout_ms {
                self.scan.probe_timeout = Duration::from_millis(ms);
            }
            if let Some(start) = scan.start_octet {
                self.scan.start_octet = start;
            }
            if let Some(end) = scan.end_octet {
                self.scan.end_octet = end;
            }
            if let Some(max) = scan.max_concurrency {
                self.scan.max_concurrency = max.max(1);
            }
            if let Some(ms) = scan.deadline_ms {
                self.scan.deadline = Some(Duration::from_millis(ms));
            }
            if scan.local_ip.is_some() {
                self.scan.local_ip = scan.local_ip;
            }
        }
        if let Some(provision) = file.provision {
            if let Some(head) = provision.sn_head {
                self.provision.sn_head = head.trim().to_string();
            }
            if let Some(manufacturer) = provision.manufacturer {
                self.provision.manufacturer = manufacturer;
            }
            if let Some(suffix) = provision.pppoe_suffix {
                self.provision.pppoe_suffix = suffix;
            }
            if let Some(password) = provision.pppoe_password {
                self.provision.pppoe_password = password;
            }
            if let Some(secs) = provision.reset_settle_secs {
                self.provision.reset_settle_secs = secs;
            }
        }
        self.source = ConfigSource::ConfigFile;
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod opt_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        let path = path.trim();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("skybox").join("config.toml"))
}

/// Load configuration from the config file
fn load_config_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load configuration with priority:
/// 1. Environment variables (SKYBOX_ADB)
/// 2. Config file (~/.config/skybox/config.toml, or SKYBOX_CONFIG)
/// 3. Default values
pub fn load_config() -> AgentConfig {
    let mut config = AgentConfig::default();

    if let Some(file) = get_config_file_path().and_then(|p| load_config_file(&p)) {
        config.apply_file(file);
    }

    if let Ok(binary) = std::env::var(ENV_ADB) {
        let binary = binary.trim();
        if !binary.is_empty() {
            tracing::info!("Using adb binary from environment variable: {}", binary);
            config.adb.binary = binary.to_string();
            config.source = ConfigSource::Environment;
        }
    }

    if config.source == ConfigSource::Default {
        tracing::debug!("Using default configuration");
    }
    config
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/skybox/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    format!(
        r#"# Skybox Configuration
# Place this file at: ~/.config/skybox/config.toml (or point SKYBOX_CONFIG at it)

[adb]
# adb executable; SKYBOX_ADB overrides this
# binary = "adb"
# port = {port}
# connect_timeout_ms = 3000

[scan]
# Per-host timeout during a subnet sweep
# probe_timeout_ms = 500
# start_octet = 1
# end_octet = 255
# max_concurrency = 256
# Overall sweep watchdog (derived from the probe timeout if unset)
# deadline_ms = 5000
# Sweep this address's /24 instead of auto-detecting
# local_ip = "192.168.1.100"

[provision]
# sn_head = "{head}"
# manufacturer = "SKYWORTH"
# pppoe_suffix = "ottx01@ottx"
# pppoe_password = "123456"
# Seconds to wait for a box to come back after a factory reset
# reset_settle_secs = 70
"#,
        port = ADB_PORT,
        head = DEFAULT_SN_HEAD
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.adb.port, 5555);
        assert_eq!(config.scan.start_octet, 1);
        assert_eq!(config.scan.end_octet, 255);
        assert_eq!(config.provision.sn_head.len(), 20);
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_partial_file_overrides_only_given_keys() {
        let file: ConfigFile = toml::from_str(
            r#"
[scan]
probe_timeout_ms = 250
local_ip = "10.0.0.7"

[provision]
reset_settle_secs = 5
"#,
        )
        .unwrap();

        let mut config = AgentConfig::default();
        config.apply_file(file);

        assert_eq!(config.scan.probe_timeout, Duration::from_millis(250));
        assert_eq!(config.scan.local_ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(config.scan.end_octet, 255);
        assert_eq!(config.adb.binary, "adb");
        assert_eq!(config.provision.reset_settle_secs, 5);
        assert_eq!(config.source, ConfigSource::ConfigFile);

        let options = config.scan_options();
        assert_eq!(options.port, 5555);
        assert_eq!(options.local_ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_example_config_parses() {
        let file: ConfigFile = toml::from_str(&generate_example_config()).unwrap();
        assert!(file.adb.is_some());
        assert!(file.scan.is_some());
    }

    #[test]
    fn test_serialized_durations_are_millis() {
        let json = serde_json::to_value(AgentConfig::default()).unwrap();
        assert_eq!(json["scan"]["probe_timeout"], 500);
        assert!(json["scan"]["deadline"].is_null());
        assert_eq!(json["source"], "default");
    }
}
