use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Per-transfer trace mode for forwarded payloads
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum DumpMode {
    /// Per-transfer summary line only
    #[default]
    None,
    /// Raw text emission of each transfer
    Ascii,
    /// Canonical offset + hex + ASCII dump of each transfer
    Hex,
}

impl DumpMode {
    /// Map a settings-file string onto a dump mode. Unknown values mean `None`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "hex" => DumpMode::Hex,
            "ascii" => DumpMode::Ascii,
            _ => DumpMode::None,
        }
    }
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    name = "tcptap",
    author, version,
    disable_version_flag = true,
    about = "Configurable TCP forwarding proxy",
    long_about = "tcptap terminates inbound TCP connections and forwards each one to a \
configured destination, shuttling bytes in both directions until either side closes or \
an inactivity timeout elapses.\n\nFeatures:\n- Multiple named proxies from an XML settings file\n\
- Per-direction delay injection for fault testing\n- Inactivity timeout\n\
- Byte-level traces (hex or ascii) of forwarded payloads\n- Per-session and per-proxy traffic statistics\n"
)]
pub struct Cli {
    /// Show version info
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Settings file with the multi-proxy configuration
    #[arg(short = 's', long = "settings-file")]
    pub settings_file: Option<PathBuf>,

    /// Trace mode for forwarded payloads
    #[arg(short = 'd', long = "message-dump", value_enum, default_value_t = DumpMode::None)]
    pub message_dump: DumpMode,

    /// Client delay in microseconds (0 - disabled)
    #[arg(long = "client-delay", default_value_t = 0)]
    pub client_delay: u64,

    /// Server delay in microseconds (0 - disabled)
    #[arg(long = "server-delay", default_value_t = 0)]
    pub server_delay: u64,

    /// Buffer size for each read, in bytes
    #[arg(short = 'b', long = "buffer-size", default_value_t = 8192)]
    pub buffer_size: usize,

    /// Inactivity timeout in microseconds (0 - disabled)
    #[arg(short = 't', long = "timeout", default_value_t = 0)]
    pub timeout: u64,

    /// Worker thread pool size (default: hardware concurrency)
    #[arg(short = 'n', long = "thread-pool-size")]
    pub thread_pool_size: Option<usize>,

    /// Log settings file name
    #[arg(long = "log-settings")]
    pub log_settings: Option<PathBuf>,

    /// Log level (trace|debug|info|warning|error|fatal)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Source hostname
    #[arg(long, default_value = "localhost")]
    pub shost: String,

    /// Source service name or port
    #[arg(long, default_value = "http-alt")]
    pub sport: String,

    /// Destination hostname
    #[arg(long, default_value = "localhost")]
    pub dhost: String,

    /// Destination service name or port
    #[arg(long, default_value = "http")]
    pub dport: String,
}

/// Errors raised while loading or interpreting configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the settings file.
    #[error("failed to read settings file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// The settings document is not well-formed XML.
    #[error("malformed settings XML: {0}")]
    Parse(String),

    /// A proxy entry lacks a required element.
    #[error("proxy entry is missing required element '{0}'")]
    MissingElement(&'static str),

    /// A settings element holds a value of the wrong shape.
    #[error("invalid value '{value}' for element '{element}'")]
    InvalidValue { element: String, value: String },

    /// An unknown log severity name was configured.
    #[error("invalid log severity '{0}' (expected trace|debug|info|warning|error|fatal)")]
    InvalidSeverity(String),
}

/// A `(host, service)` pair naming one side of a forwarding path.
///
/// The service is either a numeric port or one of the common IANA service
/// names. Resolution yields the first address returned by the resolver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub service: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
        }
    }

    /// Numeric port for this endpoint's service name.
    pub fn service_port(&self) -> io::Result<u16> {
        if let Ok(port) = self.service.parse::<u16>() {
            return Ok(port);
        }
        let port = match self.service.as_str() {
            "ftp" => 21,
            "ssh" => 22,
            "telnet" => 23,
            "smtp" => 25,
            "domain" => 53,
            "http" => 80,
            "pop3" => 110,
            "imap" => 143,
            "https" => 443,
            "http-alt" => 8080,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown service name '{}'", self.service),
                ))
            }
        };
        Ok(port)
    }

    /// Resolve to the first matching socket address.
    pub async fn resolve(&self) -> io::Result<std::net::SocketAddr> {
        let port = self.service_port()?;
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), port)).await?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", self.host),
            )
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

/// Configuration for one named proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub name: String,
    pub active: bool,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub buffer_size: usize,
    pub client_delay_us: u64,
    pub server_delay_us: u64,
    pub timeout_us: u64,
    pub dump: DumpMode,
}

impl ProxyConfig {
    /// Single-proxy configuration from command line arguments.
    pub fn from_cli(args: &Cli) -> Self {
        Self {
            name: "default".to_string(),
            active: true,
            source: Endpoint::new(args.shost.clone(), args.sport.clone()),
            destination: Endpoint::new(args.dhost.clone(), args.dport.clone()),
            buffer_size: args.buffer_size,
            client_delay_us: args.client_delay,
            server_delay_us: args.server_delay,
            timeout_us: args.timeout,
            dump: args.message_dump,
        }
    }
}

/// Logging section of the settings document
#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    pub file_name: Option<String>,
    pub severity: Option<String>,
}

/// Parsed multi-proxy configuration
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub thread_pool_size: Option<usize>,
    pub proxies: Vec<ProxyConfig>,
}

impl Settings {
    /// Load settings from an XML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        parse_settings(&text)
    }

    /// Single-proxy settings from command line arguments.
    pub fn from_cli(args: &Cli) -> Self {
        Self {
            logging: LoggingSettings::default(),
            thread_pool_size: args.thread_pool_size,
            proxies: vec![ProxyConfig::from_cli(args)],
        }
    }
}

/// One proxy element under `proxies`, accumulated field by field.
#[derive(Default)]
struct ProxyEntry {
    name: Option<String>,
    active: bool,
    shost: Option<String>,
    sport: Option<String>,
    dhost: Option<String>,
    dport: Option<String>,
    buffer_size: Option<usize>,
    client_delay: Option<u64>,
    server_delay: Option<u64>,
    timeout: Option<u64>,
    dump: DumpMode,
}

impl ProxyEntry {
    fn set(&mut self, element: &str, value: &str) -> Result<(), ConfigError> {
        match element {
            "name" => self.name = Some(value.to_string()),
            "active" => self.active = parse_number::<i64>(element, value)? != 0,
            "shost" => self.shost = Some(value.to_string()),
            "sport" => self.sport = Some(value.to_string()),
            "dhost" => self.dhost = Some(value.to_string()),
            "dport" => self.dport = Some(value.to_string()),
            "buffer-size" => self.buffer_size = Some(parse_number(element, value)?),
            "client-delay" => self.client_delay = Some(parse_number(element, value)?),
            "server-delay" => self.server_delay = Some(parse_number(element, value)?),
            "timeout" => self.timeout = Some(parse_number(element, value)?),
            "message-dump" => self.dump = DumpMode::from_name(value),
            _ => {} // unknown elements are ignored
        }
        Ok(())
    }

    fn finish(self) -> Result<ProxyConfig, ConfigError> {
        let name = self.name.ok_or(ConfigError::MissingElement("name"))?;
        Ok(ProxyConfig {
            name,
            active: self.active,
            source: Endpoint::new(
                self.shost.unwrap_or_else(|| "localhost".to_string()),
                self.sport.unwrap_or_else(|| "http-alt".to_string()),
            ),
            destination: Endpoint::new(
                self.dhost.unwrap_or_else(|| "localhost".to_string()),
                self.dport.unwrap_or_else(|| "http".to_string()),
            ),
            buffer_size: self.buffer_size.unwrap_or(8192),
            client_delay_us: self.client_delay.unwrap_or(0),
            server_delay_us: self.server_delay.unwrap_or(0),
            timeout_us: self.timeout.unwrap_or(0),
            dump: self.dump,
        })
    }
}

fn parse_number<T: std::str::FromStr>(element: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        element: element.to_string(),
        value: value.to_string(),
    })
}

/// Parse a `proxy-settings` XML document.
///
/// Children of `proxies` are one element per proxy, keyed by an arbitrary
/// tag name; unknown elements anywhere in the tree are skipped.
pub fn parse_settings(xml: &str) -> Result<Settings, ConfigError> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut settings = Settings::default();
    let mut entry: Option<ProxyEntry> = None;

    loop {
        match reader.read_event() {
            Err(e) => return Err(ConfigError::Parse(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if path_is(&path, &["proxy-settings", "proxies"]) {
                    entry = Some(ProxyEntry::default());
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                if path.len() == 3 && path_is(&path[..2], &["proxy-settings", "proxies"]) {
                    if let Some(entry) = entry.take() {
                        settings.proxies.push(entry.finish()?);
                    }
                }
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| ConfigError::Parse(e.to_string()))?;
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                match path.as_slice() {
                    [r, s, leaf] if r == "proxy-settings" && s == "logging" => {
                        match leaf.as_str() {
                            "file-name" => settings.logging.file_name = Some(value.to_string()),
                            "severity" => settings.logging.severity = Some(value.to_string()),
                            _ => {}
                        }
                    }
                    [r, s, leaf]
                        if r == "proxy-settings" && s == "thread-pool" && leaf == "size" =>
                    {
                        settings.thread_pool_size = Some(parse_number("size", value)?);
                    }
                    [r, s, _, leaf] if r == "proxy-settings" && s == "proxies" => {
                        if let Some(entry) = entry.as_mut() {
                            entry.set(leaf, value)?;
                        }
                    }
                    _ => {}
                }
            }
            Ok(_) => {}
        }
    }

    Ok(settings)
}

fn path_is(path: &[String], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}
