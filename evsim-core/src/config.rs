//! Fleet and station configuration
//!
//! A fleet configuration file is a JSON document with fleet-level settings
//! and one station template. Stations are materialized from the template by
//! index: the name gets a zero-padded suffix, the maximum power is drawn
//! from the template's variants, and the supervision URL is picked from the
//! configured list either round-robin by index or at random.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ocpp::types::{KeyValue, SampledValue};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
    /// Number of stations to simulate
    pub station_count: u32,

    /// Supervision endpoint(s); a single URL or a list
    pub supervision_url: SupervisionUrls,

    /// Pick URLs round-robin by station index instead of at random
    pub distribute_stations_equally: bool,

    /// Statistics display period in seconds; 0 disables the display loop
    pub statistics_display_interval: u64,

    /// Template every station is materialized from
    pub station_template: StationTemplate,
}

/// One URL or a list of URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SupervisionUrls {
    Single(String),
    List(Vec<String>),
}

impl SupervisionUrls {
    pub fn all(&self) -> &[String] {
        match self {
            SupervisionUrls::Single(url) => std::slice::from_ref(url),
            SupervisionUrls::List(urls) => urls,
        }
    }
}

/// Per-station template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationTemplate {
    /// Station name prefix; the station index is appended
    pub base_name: String,

    /// Vendor reported in BootNotification
    pub charge_point_vendor: String,

    /// Model reported in BootNotification
    pub charge_point_model: String,

    /// Firmware version reported in BootNotification (optional)
    pub firmware_version: Option<String>,

    /// Maximum power variants in W; each station draws one at random
    pub power_variants_w: Vec<u32>,

    /// Connector count; a single value or a per-station-index cycling list
    pub connector_count: ConnectorCount,

    /// Whether connector 0 (the station itself) reports status too
    pub use_connector_zero: bool,

    /// Connector templates; connector i uses entry (i-1) mod len
    pub connectors: Vec<ConnectorTemplate>,

    /// OCPP configuration keys exposed over GetConfiguration
    pub configuration_keys: Vec<KeyValue>,

    /// Meter sampling period in seconds while a transaction runs
    pub meter_value_interval: u64,

    /// Request timeout in seconds for live sends
    pub request_timeout: u64,

    /// Fixed delay in seconds between reconnect attempts
    pub reconnect_delay: u64,

    /// Authorization tag list file (JSON array of strings)
    pub authorization_file: Option<PathBuf>,

    /// Automatic transaction generator settings
    pub automatic_transaction_generator: AtgConfig,
}

/// Connector count as a single value or a per-station list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectorCount {
    Fixed(u32),
    PerStation(Vec<u32>),
}

impl ConnectorCount {
    /// Resolve the count for a 1-based station index.
    pub fn resolve(&self, index: u32) -> u32 {
        match self {
            ConnectorCount::Fixed(count) => *count,
            ConnectorCount::PerStation(counts) if counts.is_empty() => 0,
            ConnectorCount::PerStation(counts) => {
                counts[(index.saturating_sub(1) as usize) % counts.len()]
            }
        }
    }
}

/// Template for one connector slot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorTemplate {
    /// Status reported at boot instead of Available; parsed when the
    /// station is built, an unknown status degrades to none
    pub boot_status: Option<String>,

    /// Sample templates for MeterValues emission
    pub meter_values: Vec<SampledValue>,
}

/// Automatic transaction generator settings
///
/// All delays and durations are in seconds; `stop_after_hours` is the
/// overall run budget after which the generator stops every transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtgConfig {
    pub enable: bool,
    pub probability_of_start: f64,
    pub min_delay_between_transactions: u64,
    pub max_delay_between_transactions: u64,
    pub min_duration: u64,
    pub max_duration: u64,
    pub stop_after_hours: Option<f64>,
}

/// A station materialized from the template
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub max_power_w: u32,
    pub supervision_url: String,
    pub connector_count: u32,
    pub use_connector_zero: bool,
    pub connectors: Vec<ConnectorTemplate>,
    pub configuration_keys: Vec<KeyValue>,
    pub meter_value_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub authorization_file: Option<PathBuf>,
    pub atg: AtgConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            station_count: 1,
            supervision_url: SupervisionUrls::Single(
                "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            ),
            distribute_stations_equally: true,
            statistics_display_interval: 60,
            station_template: StationTemplate::default(),
        }
    }
}

impl Default for StationTemplate {
    fn default() -> Self {
        Self {
            base_name: "EVSIM".to_string(),
            charge_point_vendor: "evsim".to_string(),
            charge_point_model: "EVSim Virtual CP".to_string(),
            firmware_version: Some("0.1.0".to_string()),
            power_variants_w: vec![22080],
            connector_count: ConnectorCount::Fixed(2),
            use_connector_zero: false,
            connectors: vec![ConnectorTemplate {
                boot_status: None,
                meter_values: vec![SampledValue {
                    unit: Some("Wh".to_string()),
                    ..Default::default()
                }],
            }],
            configuration_keys: vec![KeyValue {
                key: "AuthorizeRemoteTxRequests".to_string(),
                readonly: false,
                value: Some("false".to_string()),
            }],
            meter_value_interval: 60,
            request_timeout: 30,
            reconnect_delay: 10,
            authorization_file: None,
            automatic_transaction_generator: AtgConfig::default(),
        }
    }
}

impl Default for AtgConfig {
    fn default() -> Self {
        Self {
            enable: false,
            probability_of_start: 0.7,
            min_delay_between_transactions: 30,
            max_delay_between_transactions: 90,
            min_duration: 60,
            max_duration: 180,
            stop_after_hours: None,
        }
    }
}

impl FleetConfig {
    /// Load a fleet configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check the configuration for values no station could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.station_count == 0 {
            return Err(ConfigError::Invalid("station count must be at least 1".into()));
        }
        let urls = self.supervision_url.all();
        if urls.is_empty() {
            return Err(ConfigError::Invalid("at least one supervision URL is required".into()));
        }
        for url in urls {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "supervision URL must be ws:// or wss://, got {}",
                    url
                )));
            }
        }
        self.station_template.validate()
    }

    /// Supervision URL for a 1-based station index: round-robin when equal
    /// distribution is configured, uniformly random otherwise.
    pub fn supervision_url_for(&self, index: u32) -> String {
        use rand::Rng;

        let urls = self.supervision_url.all();
        let url_index = if self.distribute_stations_equally {
            index as usize % urls.len()
        } else {
            rand::thread_rng().gen_range(0..urls.len())
        };
        urls[url_index].clone()
    }

    /// Materialize station `index` (1-based) from the template.
    pub fn station_info(&self, index: u32) -> StationInfo {
        self.station_template
            .materialize(index, self.supervision_url_for(index))
    }

    pub fn statistics_display_interval(&self) -> Option<Duration> {
        match self.statistics_display_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn with_station_count(mut self, count: u32) -> Self {
        self.station_count = count;
        self
    }

    pub fn with_supervision_url(mut self, url: impl Into<String>) -> Self {
        self.supervision_url = SupervisionUrls::Single(url.into());
        self
    }

    pub fn with_supervision_urls(mut self, urls: Vec<String>) -> Self {
        self.supervision_url = SupervisionUrls::List(urls);
        self
    }

    pub fn with_template(mut self, template: StationTemplate) -> Self {
        self.station_template = template;
        self
    }
}

impl StationTemplate {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_name.is_empty() {
            return Err(ConfigError::Invalid("station base name cannot be empty".into()));
        }
        if self.power_variants_w.is_empty() {
            return Err(ConfigError::Invalid("at least one power variant is required".into()));
        }
        if self.connectors.is_empty() {
            return Err(ConfigError::Invalid("at least one connector template is required".into()));
        }
        if self.meter_value_interval == 0 {
            return Err(ConfigError::Invalid("meter value interval must be at least 1s".into()));
        }
        match &self.connector_count {
            ConnectorCount::Fixed(0) => {
                return Err(ConfigError::Invalid("connector count must be at least 1".into()));
            }
            ConnectorCount::PerStation(counts) if counts.is_empty() || counts.contains(&0) => {
                return Err(ConfigError::Invalid(
                    "per-station connector counts must be non-empty and at least 1".into(),
                ));
            }
            _ => {}
        }

        let atg = &self.automatic_transaction_generator;
        if !(0.0..=1.0).contains(&atg.probability_of_start) {
            return Err(ConfigError::Invalid(
                "probability of start must be within [0, 1]".into(),
            ));
        }
        if atg.min_delay_between_transactions > atg.max_delay_between_transactions {
            return Err(ConfigError::Invalid(
                "min delay between transactions exceeds max".into(),
            ));
        }
        if atg.min_duration > atg.max_duration {
            return Err(ConfigError::Invalid("min transaction duration exceeds max".into()));
        }
        Ok(())
    }

    /// Materialize one station: pad the name with the index, draw a maximum
    /// power from the variants, resolve the connector count.
    pub fn materialize(&self, index: u32, supervision_url: String) -> StationInfo {
        use rand::seq::SliceRandom;

        let max_power_w = self
            .power_variants_w
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(22080);

        StationInfo {
            name: format!("{}-{:04}", self.base_name, index),
            vendor: self.charge_point_vendor.clone(),
            model: self.charge_point_model.clone(),
            firmware_version: self.firmware_version.clone(),
            max_power_w,
            supervision_url,
            connector_count: self.connector_count.resolve(index),
            use_connector_zero: self.use_connector_zero,
            connectors: self.connectors.clone(),
            configuration_keys: self.configuration_keys.clone(),
            meter_value_interval: Duration::from_secs(self.meter_value_interval),
            request_timeout: Duration::from_secs(self.request_timeout),
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            authorization_file: self.authorization_file.clone(),
            atg: self.automatic_transaction_generator.clone(),
        }
    }

    pub fn with_base_name(mut self, name: impl Into<String>) -> Self {
        self.base_name = name.into();
        self
    }

    pub fn with_connector_count(mut self, count: u32) -> Self {
        self.connector_count = ConnectorCount::Fixed(count);
        self
    }

    pub fn with_meter_value_interval(mut self, secs: u64) -> Self {
        self.meter_value_interval = secs;
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout = secs;
        self
    }

    pub fn with_reconnect_delay(mut self, secs: u64) -> Self {
        self.reconnect_delay = secs;
        self
    }

    pub fn with_authorization_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.authorization_file = Some(path.into());
        self
    }

    pub fn with_atg(mut self, atg: AtgConfig) -> Self {
        self.automatic_transaction_generator = atg;
        self
    }
}

impl AtgConfig {
    pub fn stop_after(&self) -> Option<Duration> {
        self.stop_after_hours
            .filter(|hours| *hours > 0.0)
            .map(|hours| Duration::from_secs_f64(hours * 3600.0))
    }
}

impl StationInfo {
    /// Template for a connector id; numbered connectors cycle through the
    /// template list, connector 0 shares the first entry.
    pub fn connector_template(&self, connector_id: u32) -> &ConnectorTemplate {
        if connector_id == 0 {
            &self.connectors[0]
        } else {
            &self.connectors[(connector_id as usize - 1) % self.connectors.len()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.station_count, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = FleetConfig::default()
            .with_station_count(8)
            .with_supervision_url("ws://csms.example:9000/ocpp")
            .with_template(
                StationTemplate::default()
                    .with_base_name("GARAGE")
                    .with_connector_count(4)
                    .with_meter_value_interval(15),
            );

        assert_eq!(config.station_count, 8);
        assert_eq!(config.supervision_url.all(), ["ws://csms.example:9000/ocpp"]);
        assert_eq!(config.station_template.base_name, "GARAGE");
        assert_eq!(config.station_template.meter_value_interval, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "stationCount": 3,
                "supervisionUrl": ["ws://a:1/ocpp", "ws://b:2/ocpp"],
                "distributeStationsEqually": true,
                "stationTemplate": {{
                    "baseName": "LOT",
                    "connectorCount": [1, 2],
                    "connectors": [{{"bootStatus": "Preparing", "meterValues": [{{"measurand": "SoC", "unit": "Percent"}}]}}],
                    "automaticTransactionGenerator": {{"enable": true, "probabilityOfStart": 0.9}}
                }}
            }}"#
        )
        .unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.station_count, 3);
        assert_eq!(config.supervision_url.all().len(), 2);
        assert_eq!(config.station_template.base_name, "LOT");
        assert!(config.station_template.automatic_transaction_generator.enable);
        assert_eq!(
            config.station_template.connectors[0].boot_status.as_deref(),
            Some("Preparing")
        );
        // Fields not present keep their defaults.
        assert_eq!(config.station_template.meter_value_interval, 60);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            FleetConfig::from_file("/nonexistent/fleet.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_single_url_form() {
        let json = r#"{"supervisionUrl": "ws://only:1/ocpp"}"#;
        let config: FleetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.supervision_url.all(), ["ws://only:1/ocpp"]);
    }

    #[test]
    fn test_connector_count_resolution() {
        assert_eq!(ConnectorCount::Fixed(3).resolve(7), 3);

        let per_station = ConnectorCount::PerStation(vec![1, 2, 4]);
        assert_eq!(per_station.resolve(1), 1);
        assert_eq!(per_station.resolve(2), 2);
        assert_eq!(per_station.resolve(3), 4);
        assert_eq!(per_station.resolve(4), 1);
    }

    #[test]
    fn test_supervision_url_distribution() {
        let urls = vec!["ws://a:1/o".to_string(), "ws://b:2/o".to_string()];
        let config = FleetConfig::default().with_supervision_urls(urls.clone());

        // Equal distribution is round-robin by index.
        assert_eq!(config.supervision_url_for(1), urls[1]);
        assert_eq!(config.supervision_url_for(2), urls[0]);
        assert_eq!(config.supervision_url_for(3), urls[1]);

        // Random pick still lands in the configured set.
        let mut random = config;
        random.distribute_stations_equally = false;
        for index in 0..16 {
            assert!(urls.contains(&random.supervision_url_for(index)));
        }
    }

    #[test]
    fn test_materialize_station() {
        let config = FleetConfig::default().with_template(
            StationTemplate::default()
                .with_base_name("LOT")
                .with_connector_count(2),
        );

        let info = config.station_info(7);
        assert_eq!(info.name, "LOT-0007");
        assert_eq!(info.connector_count, 2);
        assert!(config
            .station_template
            .power_variants_w
            .contains(&info.max_power_w));
        assert_eq!(info.meter_value_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_connector_template_cycling() {
        let mut template = StationTemplate::default();
        template.connectors = vec![
            ConnectorTemplate {
                boot_status: Some("Preparing".to_string()),
                meter_values: Vec::new(),
            },
            ConnectorTemplate {
                boot_status: None,
                meter_values: Vec::new(),
            },
        ];
        let info = template.materialize(1, "ws://a:1/o".to_string());

        assert_eq!(info.connector_template(1).boot_status.as_deref(), Some("Preparing"));
        assert!(info.connector_template(2).boot_status.is_none());
        assert_eq!(info.connector_template(3).boot_status.as_deref(), Some("Preparing"));
        // Connector 0 shares the first template.
        assert_eq!(info.connector_template(0).boot_status.as_deref(), Some("Preparing"));
    }

    #[test]
    fn test_validation_failures() {
        assert!(FleetConfig::default().with_station_count(0).validate().is_err());
        assert!(FleetConfig::default()
            .with_supervision_url("http://not-a-ws/ocpp")
            .validate()
            .is_err());
        assert!(FleetConfig::default()
            .with_supervision_urls(Vec::new())
            .validate()
            .is_err());

        let mut bad_power = StationTemplate::default();
        bad_power.power_variants_w.clear();
        assert!(FleetConfig::default().with_template(bad_power).validate().is_err());

        let mut bad_atg = AtgConfig::default();
        bad_atg.probability_of_start = 1.5;
        assert!(FleetConfig::default()
            .with_template(StationTemplate::default().with_atg(bad_atg))
            .validate()
            .is_err());

        let mut inverted = AtgConfig::default();
        inverted.min_duration = 500;
        inverted.max_duration = 100;
        assert!(FleetConfig::default()
            .with_template(StationTemplate::default().with_atg(inverted))
            .validate()
            .is_err());
    }

    #[test]
    fn test_stop_after_conversion() {
        let mut atg = AtgConfig::default();
        assert!(atg.stop_after().is_none());

        atg.stop_after_hours = Some(0.5);
        assert_eq!(atg.stop_after(), Some(Duration::from_secs(1800)));

        atg.stop_after_hours = Some(0.0);
        assert!(atg.stop_after().is_none());
    }
}
