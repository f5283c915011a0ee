use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// A `(listen_port, backend_port)` pair. The proxy binds one listener per
/// mapping and forwards accepted connections to the same-index backend port.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(from = "[u16; 2]")]
pub struct PortMapping {
    pub listen_port: u16,
    pub backend_port: u16,
}

impl From<[u16; 2]> for PortMapping {
    fn from(pair: [u16; 2]) -> Self {
        Self {
            listen_port: pair[0],
            backend_port: pair[1],
        }
    }
}

/// IPMI password wrapper. Never printed; `Debug` redacts the value.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Global configuration, loaded once at startup from a JSON file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the proxy listeners bind to
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,

    /// `[listen_port, backend_port]` pairs, one listener each
    #[serde(default = "default_port_mappings")]
    pub port_mappings: Vec<PortMapping>,

    /// Hostname or address of the managed backend
    pub target_host: String,

    /// Hostname or address of the backend's IPMI interface
    pub ipmi_host: String,

    /// IPMI username
    pub ipmi_user: String,

    /// IPMI password (redacted from all output)
    pub ipmi_password: Secret,

    /// Path to the ipmitool executable (overridden by the `IPMITOOL`
    /// environment variable when set)
    pub ipmi_path: String,

    /// Seconds without activity before the backend is powered off
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u32,

    /// Seconds allowed for the backend to become reachable after power-on
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u32,

    /// Seconds between out-of-band state observations
    #[serde(default = "default_check_interval")]
    pub check_interval: u32,

    /// Maximum number of held connections before new ones are rejected
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u32,

    /// Seconds a held connection may wait before it fails with 504
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u32,
}

fn default_proxy_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port_mappings() -> Vec<PortMapping> {
    vec![PortMapping {
        listen_port: 8080,
        backend_port: 80,
    }]
}

fn default_inactivity_timeout() -> u32 {
    3600 // 1 hour
}

fn default_startup_timeout() -> u32 {
    300 // 5 minutes
}

fn default_check_interval() -> u32 {
    30
}

fn default_max_queue_size() -> u32 {
    1000
}

fn default_request_timeout() -> u32 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("cannot read config file {}: {}", path.as_ref().display(), e)
        })?;
        let mut config: Config = serde_json::from_str(&content)?;

        // The test harness points IPMITOOL at a mock tool.
        if let Ok(tool) = std::env::var("IPMITOOL") {
            if !tool.is_empty() {
                config.ipmi_path = tool;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, collecting every problem before failing.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (key, value) in [
            ("target_host", &self.target_host),
            ("ipmi_host", &self.ipmi_host),
            ("ipmi_user", &self.ipmi_user),
            ("ipmi_path", &self.ipmi_path),
        ] {
            if value.is_empty() {
                errors.push(format!("'{}' must not be empty", key));
            }
        }
        if self.ipmi_password.expose().is_empty() {
            errors.push("'ipmi_password' must not be empty".to_string());
        }

        if self.port_mappings.is_empty() {
            errors.push("'port_mappings' must contain at least one [listen_port, backend_port] pair".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for mapping in &self.port_mappings {
            if mapping.listen_port == 0 || mapping.backend_port == 0 {
                errors.push(format!(
                    "port mapping [{}, {}]: ports must be non-zero",
                    mapping.listen_port, mapping.backend_port
                ));
            }
            if mapping.listen_port != 0 && !seen.insert(mapping.listen_port) {
                errors.push(format!(
                    "listen port {} appears in more than one mapping",
                    mapping.listen_port
                ));
            }
        }

        for (key, value) in [
            ("inactivity_timeout", self.inactivity_timeout),
            ("startup_timeout", self.startup_timeout),
            ("check_interval", self.check_interval),
            ("max_queue_size", self.max_queue_size),
            ("request_timeout", self.request_timeout),
        ] {
            if value == 0 {
                errors.push(format!("'{}' must be a positive number", key));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Runtime timing knobs as `Duration`s.
    pub fn settings(&self) -> Settings {
        Settings {
            inactivity_timeout: Duration::from_secs(u64::from(self.inactivity_timeout)),
            startup_timeout: Duration::from_secs(u64::from(self.startup_timeout)),
            check_interval: Duration::from_secs(u64::from(self.check_interval)),
            request_timeout: Duration::from_secs(u64::from(self.request_timeout)),
            max_queue_size: self.max_queue_size as usize,
            ..Settings::default()
        }
    }
}

/// Resolved runtime settings. Config values are whole seconds; keeping
/// `Duration`s internally lets tests run at millisecond scale.
#[derive(Debug, Clone)]
pub struct Settings {
    pub inactivity_timeout: Duration,
    pub startup_timeout: Duration,
    pub check_interval: Duration,
    pub request_timeout: Duration,
    pub max_queue_size: usize,
    /// Hard timeout for one external IPMI tool invocation
    pub ipmi_timeout: Duration,
    /// Timeout for one reachability probe
    pub probe_timeout: Duration,
    /// Upper bound on the backend dial timeout (the remaining intent
    /// deadline caps it further)
    pub dial_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(3600),
            startup_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_queue_size: 1000,
            ipmi_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "target_host": "server.lan",
            "ipmi_host": "ipmi.lan",
            "ipmi_user": "admin",
            "ipmi_password": "hunter2",
            "ipmi_path": "/usr/bin/ipmitool"
        }"#
    }

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy_host, "0.0.0.0");
        assert_eq!(
            config.port_mappings,
            vec![PortMapping {
                listen_port: 8080,
                backend_port: 80
            }]
        );
        assert_eq!(config.inactivity_timeout, 3600);
        assert_eq!(config.startup_timeout, 300);
        assert_eq!(config.check_interval, 30);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.request_timeout, 60);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "proxy_host": "127.0.0.1",
            "port_mappings": [[8080, 80], [8443, 443]],
            "target_host": "server.lan",
            "ipmi_host": "ipmi.lan",
            "ipmi_user": "admin",
            "ipmi_password": "hunter2",
            "ipmi_path": "/usr/bin/ipmitool",
            "inactivity_timeout": 600,
            "startup_timeout": 120,
            "check_interval": 10,
            "max_queue_size": 50,
            "request_timeout": 30
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.port_mappings.len(), 2);
        assert_eq!(config.port_mappings[1].listen_port, 8443);
        assert_eq!(config.port_mappings[1].backend_port, 443);
        assert_eq!(config.inactivity_timeout, 600);
        assert_eq!(config.max_queue_size, 50);
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let json = r#"{ "target_host": "server.lan" }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_duplicate_listen_port_rejected() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.port_mappings = vec![
            PortMapping { listen_port: 8080, backend_port: 80 },
            PortMapping { listen_port: 8080, backend_port: 443 },
        ];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("more than one mapping"), "{}", err);
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.port_mappings = vec![PortMapping { listen_port: 8080, backend_port: 0 }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.inactivity_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_debug_redacts() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_settings_conversion() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        let settings = config.settings();
        assert_eq!(settings.inactivity_timeout, Duration::from_secs(3600));
        assert_eq!(settings.check_interval, Duration::from_secs(30));
        assert_eq!(settings.max_queue_size, 1000);
        assert_eq!(settings.ipmi_timeout, Duration::from_secs(15));
        assert_eq!(settings.probe_timeout, Duration::from_secs(2));
        assert_eq!(settings.dial_timeout, Duration::from_secs(5));
    }
}
