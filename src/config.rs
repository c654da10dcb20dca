//! Node configuration loading: a single TOML file describing channels,
//! BBS/alerter/chat/weather tuning, and the data directory.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub own_callsign: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub fill_in: bool,
    #[serde(default = "default_max_wide_n")]
    pub max_wide_n: u8,
    #[serde(default)]
    pub append_digi_callsign: bool,
    #[serde(default)]
    pub id_on_repeat: bool,
    #[serde(default)]
    pub explicit_digis: Vec<String>,
}

fn default_max_wide_n() -> u8 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BbsConfig {
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_sec: u64,
}

fn default_inactivity_timeout() -> u64 {
    300
}

impl Default for BbsConfig {
    fn default() -> Self {
        BbsConfig {
            inactivity_timeout_sec: default_inactivity_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AlerterConfig {
    #[serde(default)]
    pub default_channel: Option<u32>,
}

impl Default for AlerterConfig {
    fn default() -> Self {
        AlerterConfig { default_channel: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WeatherConfig {
    #[serde(default)]
    pub digipeat_channels: Vec<u32>,
    #[serde(default)]
    pub same_codes: Vec<String>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            digipeat_channels: Vec::new(),
            same_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackgroundConfig {
    #[serde(default = "default_metrics_interval")]
    pub metrics_check_interval_sec: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig {
            metrics_check_interval_sec: default_metrics_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub node_id: String,
    pub own_callsign: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub bbs: BbsConfig,
    #[serde(default)]
    pub alerter: AlerterConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    ///
    /// # Returns
    /// * `Ok(NodeConfig)` if the file was successfully loaded and parsed
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            node-id = "N1"
            own-callsign = "NA4WX-7"

            [[channels]]
            id = 1
            name = "vhf"
            kind = "serial"
            own-callsign = "NA4WX-7"
            device = "/dev/ttyUSB0"
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].max_wide_n, 2);
        assert_eq!(config.bbs.inactivity_timeout_sec, 300);
    }
}
