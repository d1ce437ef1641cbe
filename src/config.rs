use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::Url;
use serde::Deserialize;

use crate::cli::Cli;
use crate::duration::RosDuration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Regular expressions matched against incoming log lines; each must
    /// carry a named capture group `IP` holding the offending address.
    #[serde(default)]
    pub regexps: Vec<String>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// UDP port the syslog intake listens on.
    pub port: u16,
    /// Ban duration for dynamically detected offenders.
    pub blocktime: RosDuration,
    /// Run the per-device expiry scheduler. When off, expired entries are
    /// left to the device's own timeout handling.
    pub autodelete: bool,
    /// Comment attached to dynamically added banlist entries.
    pub comment: Option<String>,
    pub metrics_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 10514,
            blocktime: RosDuration(Duration::from_secs(24 * 3600)),
            autodelete: true,
            comment: None,
            metrics_addr: "127.0.0.1:3000".parse().expect("valid default addr"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default)]
    pub disabled: bool,
    /// Router host, optionally with a port; the REST API lives on the
    /// www/www-ssl service so the scheme's default port is already right.
    pub address: String,
    pub user: String,
    pub passwd: String,
    #[serde(default)]
    pub use_tls: bool,
    /// Name of the managed address-list.
    #[serde(default = "default_banlist")]
    pub banlist: String,
    /// Prefixes that must never be banned. An `@name` entry imports the
    /// contents of that address-list from the device at startup.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Prefixes that must always be banned permanently. `@name` imports
    /// work here too.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

fn default_banlist() -> String {
    "blacklist".to_string()
}

impl DeviceConfig {
    pub fn base_url(&self) -> Result<Url, anyhow::Error> {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}", self.address)
            .parse()
            .with_context(|| format!("invalid device address `{}`", self.address))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.regexps.is_empty() {
            bail!("need at least one valid regexp");
        }
        let mut has_enabled = false;
        for (name, device) in &self.devices {
            if device.disabled {
                continue;
            }
            if device.address.is_empty() {
                bail!("{name}: address is a required field");
            }
            if device.user.is_empty() {
                bail!("{name}: user is a required field");
            }
            if device.passwd.is_empty() {
                bail!("{name}: passwd is a required field");
            }
            has_enabled = true;
        }
        if !has_enabled {
            bail!("need at least one enabled device configuration");
        }
        Ok(())
    }

    /// Command line flags override the config file, but only when given.
    pub fn merge_cli(&mut self, args: &Cli) {
        if let Some(port) = args.port {
            self.settings.port = port;
        }
        if let Some(blocktime) = args.blocktime {
            self.settings.blocktime = blocktime;
        }
        if let Some(autodelete) = args.autodelete {
            self.settings.autodelete = autodelete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        regexps = ['sshd.*Failed password .* from (?P<IP>\S+)']

        [settings]
        port = 1514
        blocktime = "1h30m"

        [devices.gateway]
        address = "192.168.88.1"
        user = "api"
        passwd = "secret"
        whitelist = ["192.168.0.0/16"]
        blacklist = ["203.0.113.0/24"]

        [devices.branch]
        disabled = true
        address = ""
        user = ""
        passwd = ""
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.settings.port, 1514);
        assert_eq!(
            config.settings.blocktime,
            RosDuration(Duration::from_secs(90 * 60))
        );
        assert!(config.settings.autodelete);

        let gateway = &config.devices["gateway"];
        assert_eq!(gateway.banlist, "blacklist");
        assert!(!gateway.use_tls);
        assert_eq!(gateway.base_url().unwrap().as_str(), "http://192.168.88.1/");

        // Disabled devices escape field validation.
        assert!(config.devices["branch"].disabled);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let broken = r#"
            regexps = ['(?P<IP>\S+)']

            [devices.gateway]
            address = "192.168.88.1"
            user = ""
            passwd = "x"
        "#;
        let config: Config = toml::from_str(broken).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("user is a required field"), "{err}");
    }

    #[test]
    fn rejects_empty_regexps_and_devices() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("regexp"), "{err}");

        let config: Config = toml::from_str("regexps = ['(?P<IP>.*)']").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least one enabled device"), "{err}");
    }

    #[test]
    fn cli_overrides_only_given_flags() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let args = Cli {
            config: "unused".into(),
            port: Some(5678),
            blocktime: None,
            autodelete: Some(false),
        };
        config.merge_cli(&args);
        assert_eq!(config.settings.port, 5678);
        assert_eq!(
            config.settings.blocktime,
            RosDuration(Duration::from_secs(90 * 60))
        );
        assert!(!config.settings.autodelete);
    }
}
