//! Configuration: TOML file at `~/.kubelink/config.toml` + CLI overrides.

use anyhow::{bail, Context, Result};
use kubelink_core::engine::Hooks;
use kubelink_core::{DialOptions, ReadinessPolicy, Zone};
use serde::Deserialize;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "~/.kubelink/config.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub dns: DnsSection,
    #[serde(default)]
    pub forward: ForwardSection,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 0 disables keepalive.
    #[serde(default = "default_keepalive")]
    pub tcp_keepalive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub pre_up: Option<String>,
    #[serde(default)]
    pub post_up: Option<String>,
    #[serde(default)]
    pub pre_down: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            device: default_device(),
            log_level: default_log_level(),
            tcp_keepalive_secs: default_keepalive(),
            connect_timeout_ms: default_connect_timeout(),
            pre_up: None,
            post_up: None,
            pre_down: None,
        }
    }
}

/// `[dns]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    /// Explicit DNS pod; otherwise discovered by label.
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default = "default_dns_namespace")]
    pub namespace: String,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_dns_local_port")]
    pub local_port: u16,
    #[serde(default)]
    pub proxy: bool,
    #[serde(default = "default_proxy_listen")]
    pub proxy_listen: String,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            pod: None,
            namespace: default_dns_namespace(),
            zone: default_zone(),
            local_port: default_dns_local_port(),
            proxy: false,
            proxy_listen: default_proxy_listen(),
        }
    }
}

/// `[forward]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Exclusive.
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// 0 means no age limit.
    #[serde(default)]
    pub max_session_age_secs: u64,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval(),
            gc_interval_secs: default_gc_interval(),
            max_session_age_secs: 0,
        }
    }
}

fn default_device() -> String {
    "redirect://127.0.0.1:15001".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_keepalive() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_dns_namespace() -> String {
    kubelink_core::discovery::DEFAULT_DNS_NAMESPACE.to_string()
}
fn default_zone() -> String {
    kubelink_core::codec::DEFAULT_ZONE.to_string()
}
fn default_dns_local_port() -> u16 {
    5300
}
fn default_proxy_listen() -> String {
    "127.0.0.1:53".to_string()
}
fn default_port_range_start() -> u16 {
    30000
}
fn default_port_range_end() -> u16 {
    40000
}
fn default_readiness_attempts() -> u32 {
    4
}
fn default_readiness_interval() -> u64 {
    1000
}
fn default_gc_interval() -> u64 {
    60
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<String>,
    pub log_level: Option<String>,
    pub dns_pod: Option<String>,
    pub dns_namespace: Option<String>,
    pub dns_zone: Option<String>,
    pub dns_local_port: Option<u16>,
    pub dns_proxy: bool,
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub pod: Option<String>,
    pub namespace: String,
    /// Starting zone; replaced by the one discovered at startup.
    pub zone: Zone,
    pub local_port: u16,
    pub proxy: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub ports: Range<u16>,
    pub readiness: ReadinessPolicy,
    pub gc_interval: Duration,
    pub max_session_age: Option<Duration>,
}

/// Resolved configuration (paths expanded, CLI overrides applied, validated).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub device: String,
    pub log_level: String,
    pub dial: DialOptions,
    pub hooks: Hooks,
    pub dns: DnsSettings,
    pub forward: ForwardSettings,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// The file the values came from; `None` when running on defaults.
    pub source: Option<PathBuf>,
}

impl LinkConfig {
    /// Load config from a TOML file (a missing file means defaults), then
    /// apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let (file, source) = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                let file = toml::from_str::<ConfigFile>(&content)
                    .with_context(|| format!("config parse error in {}", path.display()))?;
                (file, Some(path))
            }
            _ => (ConfigFile::default(), None),
        };
        let mut config = Self::resolve(file, overrides)?;
        config.source = source;
        Ok(config)
    }

    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<Self> {
        let ConfigFile {
            engine,
            dns,
            forward,
        } = file;

        let dial = DialOptions {
            keepalive: match engine.tcp_keepalive_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            connect_timeout: Duration::from_millis(engine.connect_timeout_ms),
            ..DialOptions::default()
        };
        dial.validate()?;

        if forward.port_range_start >= forward.port_range_end {
            bail!(
                "empty forward port range {}..{}",
                forward.port_range_start,
                forward.port_range_end
            );
        }
        if forward.readiness_attempts == 0 {
            bail!("readiness_attempts must be at least 1");
        }
        if forward.gc_interval_secs == 0 {
            bail!("gc_interval_secs must be at least 1");
        }
        let ports = forward.port_range_start..forward.port_range_end;

        let local_port = overrides.dns_local_port.unwrap_or(dns.local_port);
        if ports.contains(&local_port) {
            bail!(
                "dns local port {local_port} overlaps the forward port range {}..{}",
                ports.start,
                ports.end
            );
        }

        let proxy = if overrides.dns_proxy || dns.proxy {
            let listen = dns
                .proxy_listen
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid proxy_listen {:?}", dns.proxy_listen))?;
            Some(listen)
        } else {
            None
        };

        let zone = overrides.dns_zone.unwrap_or(dns.zone);
        if zone.trim().is_empty() {
            bail!("dns zone must not be empty");
        }

        let device = overrides.device.unwrap_or(engine.device);
        if device.trim().is_empty() {
            bail!("device must not be empty");
        }

        Ok(Self {
            device,
            log_level: overrides.log_level.unwrap_or(engine.log_level),
            dial,
            hooks: Hooks {
                pre_up: engine.pre_up,
                post_up: engine.post_up,
                pre_down: engine.pre_down,
            },
            dns: DnsSettings {
                pod: overrides.dns_pod.or(dns.pod),
                namespace: overrides.dns_namespace.unwrap_or(dns.namespace),
                zone: Zone::new(zone),
                local_port,
                proxy,
            },
            forward: ForwardSettings {
                ports,
                readiness: ReadinessPolicy {
                    attempts: forward.readiness_attempts,
                    interval: Duration::from_millis(forward.readiness_interval_ms),
                },
                gc_interval: Duration::from_secs(forward.gc_interval_secs),
                max_session_age: match forward.max_session_age_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
            kubeconfig: overrides.kubeconfig.as_deref().map(expand_tilde_str),
            context: overrides.context,
            source: None,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = LinkConfig::resolve(ConfigFile::default(), Overrides::default()).unwrap();
        assert_eq!(config.device, "redirect://127.0.0.1:15001");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.dial.keepalive, Some(Duration::from_secs(30)));
        assert_eq!(config.dns.namespace, "kube-system");
        assert_eq!(config.dns.zone.as_str(), "cluster.local");
        assert_eq!(config.dns.local_port, 5300);
        assert!(config.dns.proxy.is_none());
        assert_eq!(config.forward.ports, 30000..40000);
        assert_eq!(config.forward.readiness, ReadinessPolicy::default());
        assert_eq!(config.forward.gc_interval, Duration::from_secs(60));
        assert!(config.forward.max_session_age.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            LinkConfig::load(Some(&dir.path().join("absent.toml")), Overrides::default()).unwrap();
        assert_eq!(config.forward.ports, 30000..40000);
        assert!(config.source.is_none());
    }

    #[test]
    fn test_file_values_and_overrides() {
        let file = write_config(
            r#"
[engine]
device = "redirect://0.0.0.0:15001"
log_level = "debug"
tcp_keepalive_secs = 0
pre_up = "iptables -t nat -N KUBELINK"

[dns]
pod = "coredns-abc"
zone = "corp.internal"
proxy = true
proxy_listen = "127.0.0.1:5353"

[forward]
port_range_start = 31000
port_range_end = 31100
max_session_age_secs = 3600
"#,
        );
        let overrides = Overrides {
            log_level: Some("trace".into()),
            dns_pod: Some("coredns-xyz".into()),
            ..Default::default()
        };
        let config = LinkConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.source.as_deref(), Some(file.path()));
        assert_eq!(config.device, "redirect://0.0.0.0:15001");
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.dial.keepalive, None);
        assert_eq!(
            config.hooks.pre_up.as_deref(),
            Some("iptables -t nat -N KUBELINK")
        );
        assert_eq!(config.dns.pod.as_deref(), Some("coredns-xyz"));
        assert_eq!(config.dns.zone.as_str(), "corp.internal");
        assert_eq!(config.dns.proxy, Some("127.0.0.1:5353".parse().unwrap()));
        assert_eq!(config.forward.ports, 31000..31100);
        assert_eq!(
            config.forward.max_session_age,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[forward]\nport_range_start = 40000\nport_range_end = 30000\n",
            "[forward]\nreadiness_attempts = 0\n",
            "[engine]\nconnect_timeout_ms = 0\n",
            "[dns]\nlocal_port = 30500\n",
            "[dns]\nproxy = true\nproxy_listen = \"localhost\"\n",
            "[dns]\nzone = \"\"\n",
        ];
        for content in cases {
            let file = write_config(content);
            assert!(
                LinkConfig::load(Some(file.path()), Overrides::default()).is_err(),
                "{content:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let file = write_config("[engine\n");
        let err = LinkConfig::load(Some(file.path()), Overrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("config parse error"));
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/.kube/config"), home.join(".kube/config"));
        }
        assert_eq!(expand_tilde_str("/etc/kube"), PathBuf::from("/etc/kube"));
    }
}
