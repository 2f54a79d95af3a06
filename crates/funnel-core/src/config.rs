//! Tunneled service configuration.
//!
//! Holds the enabled state and parameters of every service kind the server
//! can attach to a session. Configuration is merged field by field:
//! 1. Built-in defaults
//! 2. `services` section of the JSON config file
//! 3. Command-line overrides (`--gateway-ports`)
//!
//! A field missing from an update keeps its last known value; a field that is
//! present but malformed is reported as [`Error::ConfigType`].

use std::fmt;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[cfg(windows)]
const DEFAULT_SHELL_PATH: &str = "C:\\windows\\system32\\cmd.exe";
#[cfg(not(windows))]
const DEFAULT_SHELL_PATH: &str = "/bin/bash";

/// Kind of tunneled service a session can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    DatagramForwarder,
    DatagramListener,
    StreamForwarder,
    StreamListener,
    Shell,
    Socks,
    Copy,
}

impl ServiceKind {
    /// All kinds, in the order they are merged, reported and started.
    pub const ALL: [Self; 7] = [
        Self::DatagramForwarder,
        Self::DatagramListener,
        Self::StreamForwarder,
        Self::StreamListener,
        Self::Shell,
        Self::Socks,
        Self::Copy,
    ];

    /// Name of the service section in configuration documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DatagramForwarder => "datagram_forwarder",
            Self::DatagramListener => "datagram_listener",
            Self::StreamForwarder => "stream_forwarder",
            Self::StreamListener => "stream_listener",
            Self::Shell => "shell",
            Self::Socks => "socks",
            Self::Copy => "copy",
        }
    }

    /// Whether this kind carries a `gateway_ports` setting.
    pub const fn is_listener(self) -> bool {
        matches!(self, Self::DatagramListener | Self::StreamListener)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service with no parameters besides its enabled flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceToggle {
    #[serde(rename = "enable")]
    pub enabled: bool,
}

/// Listener service (stream or datagram).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerService {
    #[serde(rename = "enable")]
    pub enabled: bool,
    /// Whether listening ports may bind beyond the loopback interface.
    pub gateway_ports: bool,
}

/// Remote shell service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellService {
    #[serde(rename = "enable")]
    pub enabled: bool,
    /// Shell binary, trimmed.
    pub path: String,
    /// Extra shell arguments, trimmed.
    pub args: String,
}

/// Configuration of every tunneled service.
///
/// The server captures a clone at construction; later updates never reach
/// connections that are already running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    datagram_forwarder: ServiceToggle,
    datagram_listener: ListenerService,
    stream_forwarder: ServiceToggle,
    stream_listener: ListenerService,
    shell: ShellService,
    socks: ServiceToggle,
    copy: ServiceToggle,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            datagram_forwarder: ServiceToggle { enabled: true },
            datagram_listener: ListenerService {
                enabled: true,
                gateway_ports: false,
            },
            stream_forwarder: ServiceToggle { enabled: true },
            stream_listener: ListenerService {
                enabled: true,
                gateway_ports: false,
            },
            shell: ShellService {
                enabled: false,
                path: DEFAULT_SHELL_PATH.to_string(),
                args: String::new(),
            },
            socks: ServiceToggle { enabled: true },
            copy: ServiceToggle { enabled: true },
        }
    }
}

impl ServiceConfig {
    /// Build a configuration from a full config document (`{"services": {...}}`).
    ///
    /// A document without a `services` section yields the defaults.
    pub fn from_document(document: &Value) -> Result<Self> {
        let mut config = Self::default();
        match document.get("services") {
            Some(services) => config.update(services)?,
            None => debug!("Config document has no services section, using defaults"),
        }
        Ok(config)
    }

    /// Merge a `services` object into this configuration.
    ///
    /// Sections and fields absent from `raw` are left untouched. The update is
    /// all-or-nothing: on error the configuration is unchanged.
    pub fn update(&mut self, raw: &Value) -> Result<()> {
        let sections = raw
            .as_object()
            .ok_or_else(|| Error::config_type("services", "an object"))?;

        let mut next = self.clone();
        for kind in ServiceKind::ALL {
            let Some(section) = sections.get(kind.as_str()) else {
                debug!(service = %kind, "Update service: configuration not found");
                continue;
            };
            let section = section
                .as_object()
                .ok_or_else(|| Error::config_type(kind.as_str(), "an object"))?;
            next.merge_section(kind, section)?;
        }

        *self = next;
        Ok(())
    }

    fn merge_section(&mut self, kind: ServiceKind, section: &Map<String, Value>) -> Result<()> {
        let enabled = read_bool(section, kind, "enable")?;
        match kind {
            ServiceKind::DatagramForwarder => merge_toggle(&mut self.datagram_forwarder, enabled),
            ServiceKind::StreamForwarder => merge_toggle(&mut self.stream_forwarder, enabled),
            ServiceKind::Socks => merge_toggle(&mut self.socks, enabled),
            ServiceKind::Copy => merge_toggle(&mut self.copy, enabled),
            ServiceKind::DatagramListener | ServiceKind::StreamListener => {
                let gateway_ports = read_bool(section, kind, "gateway_ports")?;
                let listener = if kind == ServiceKind::DatagramListener {
                    &mut self.datagram_listener
                } else {
                    &mut self.stream_listener
                };
                if let Some(enabled) = enabled {
                    listener.enabled = enabled;
                }
                if let Some(gateway_ports) = gateway_ports {
                    listener.gateway_ports = gateway_ports;
                }
            }
            ServiceKind::Shell => {
                let path = read_trimmed(section, kind, "path")?;
                let args = read_trimmed(section, kind, "args")?;
                if let Some(enabled) = enabled {
                    self.shell.enabled = enabled;
                }
                if let Some(path) = path {
                    self.shell.path = path;
                }
                if let Some(args) = args {
                    self.shell.args = args;
                }
            }
        }
        Ok(())
    }

    /// Force the gateway-ports flag of both listener services.
    pub const fn set_gateway_ports(&mut self, gateway_ports: bool) {
        self.datagram_listener.gateway_ports = gateway_ports;
        self.stream_listener.gateway_ports = gateway_ports;
    }

    pub const fn datagram_forwarder(&self) -> &ServiceToggle {
        &self.datagram_forwarder
    }

    pub const fn datagram_listener(&self) -> &ListenerService {
        &self.datagram_listener
    }

    pub const fn stream_forwarder(&self) -> &ServiceToggle {
        &self.stream_forwarder
    }

    pub const fn stream_listener(&self) -> &ListenerService {
        &self.stream_listener
    }

    pub const fn shell(&self) -> &ShellService {
        &self.shell
    }

    pub const fn socks(&self) -> &ServiceToggle {
        &self.socks
    }

    pub const fn copy(&self) -> &ServiceToggle {
        &self.copy
    }

    /// Whether the given service kind is enabled.
    pub const fn is_enabled(&self, kind: ServiceKind) -> bool {
        match kind {
            ServiceKind::DatagramForwarder => self.datagram_forwarder.enabled,
            ServiceKind::DatagramListener => self.datagram_listener.enabled,
            ServiceKind::StreamForwarder => self.stream_forwarder.enabled,
            ServiceKind::StreamListener => self.stream_listener.enabled,
            ServiceKind::Shell => self.shell.enabled,
            ServiceKind::Socks => self.socks.enabled,
            ServiceKind::Copy => self.copy.enabled,
        }
    }

    /// Gateway-ports flag for listener kinds, `None` for every other kind.
    pub const fn gateway_ports(&self, kind: ServiceKind) -> Option<bool> {
        match kind {
            ServiceKind::DatagramListener => Some(self.datagram_listener.gateway_ports),
            ServiceKind::StreamListener => Some(self.stream_listener.gateway_ports),
            _ => None,
        }
    }

    /// Enabled service kinds in [`ServiceKind::ALL`] order.
    pub fn enabled_services(&self) -> Vec<ServiceKind> {
        ServiceKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    /// Render this configuration as a config document (`{"services": {...}}`).
    pub fn to_document(&self) -> Result<Value> {
        let services = serde_json::to_value(self)?;
        Ok(serde_json::json!({ "services": services }))
    }

    /// Log security-relevant settings of enabled services.
    pub fn log_summary(&self) {
        if self.datagram_listener.enabled && self.datagram_listener.gateway_ports {
            warn!(service = %ServiceKind::DatagramListener, "Gateway ports allowed");
        }
        if self.stream_listener.enabled && self.stream_listener.gateway_ports {
            warn!(service = %ServiceKind::StreamListener, "Gateway ports allowed");
        }
        if self.shell.enabled {
            info!(service = %ServiceKind::Shell, path = %self.shell.path, "Shell path");
            if !self.shell.args.is_empty() {
                info!(service = %ServiceKind::Shell, args = %self.shell.args, "Shell args");
            }
        }
    }

    /// Log the On/Off status of every service.
    pub fn log_enabled_status(&self) {
        for kind in ServiceKind::ALL {
            let status = if self.is_enabled(kind) { "On" } else { "Off" };
            info!(service = %kind, status, "Service status");
        }
    }
}

const fn merge_toggle(toggle: &mut ServiceToggle, enabled: Option<bool>) {
    if let Some(enabled) = enabled {
        toggle.enabled = enabled;
    }
}

fn field_name(kind: ServiceKind, key: &str) -> String {
    format!("services.{kind}.{key}")
}

fn read_bool(section: &Map<String, Value>, kind: ServiceKind, key: &str) -> Result<Option<bool>> {
    let Some(value) = section.get(key) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_u64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| Error::config_type(field_name(kind, key), "a boolean"))
}

fn read_trimmed(
    section: &Map<String, Value>,
    kind: ServiceKind,
    key: &str,
) -> Result<Option<String>> {
    match section.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(Error::config_type(field_name(kind, key), "a string")),
    }
}

/// Read and parse a JSON config document.
pub fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Load the service configuration from a JSON config file.
pub fn load_services(path: &Path) -> Result<ServiceConfig> {
    let document = load_config_file(path)?;
    ServiceConfig::from_document(&document)
}
