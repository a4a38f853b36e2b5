//! Network configuration
//!
//! A network is described by a TOML document, e.g.
//!
//! ```toml
//! transport = "socketcan"
//! interface = "can0"
//! protocol = "canopen"
//!
//! [sdo]
//! response_timeout_ms = 1000
//! retries = 3
//! min_backoff_ms = 200
//! backoff_factor = 2
//!
//! [nmt]
//! bootup_timeout_ms = 10000
//! ```
//!
//! Every field except `transport` has a default.

use std::{path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

/// Errors from loading a [`NetworkConfig`]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A file or interface could not be opened
    #[snafu(display("I/O error on {path}: {source}"))]
    Io {
        /// The file path or interface name
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The TOML could not be parsed
    #[snafu(display("Error parsing network config: {source}"))]
    Parse {
        /// The parser error
        source: toml::de::Error,
    },
    /// The transport name is not known
    #[snafu(display("Unknown transport '{name}'"))]
    UnknownTransport {
        /// The unrecognized name
        name: String,
    },
    /// The protocol name is not known
    #[snafu(display("Unknown protocol '{name}'"))]
    UnknownProtocol {
        /// The unrecognized name
        name: String,
    },
    /// The transport requires a parameter which was not given
    #[snafu(display("Transport '{transport}' requires '{parameter}'"))]
    MissingParameter {
        /// The transport name
        transport: String,
        /// The missing parameter
        parameter: String,
    },
}

/// The kind of CAN interface
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// A Linux socketcan interface
    SocketCan,
    /// An in-process bus, for simulation and testing
    #[default]
    Virtual,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socketcan" => Ok(TransportKind::SocketCan),
            "virtual" => Ok(TransportKind::Virtual),
            _ => UnknownTransportSnafu { name: s }.fail(),
        }
    }
}

/// How received frames are dispatched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Frames are routed to nodes, then published by arbitration ID and on the wildcard topic
    #[default]
    CanOpen,
    /// Frames are only published on the wildcard topic
    Raw,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "canopen" => Ok(Protocol::CanOpen),
            "raw" => Ok(Protocol::Raw),
            _ => UnknownProtocolSnafu { name: s }.fail(),
        }
    }
}

/// SDO client timing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SdoConfig {
    /// How long to wait for each response
    pub response_timeout_ms: u64,
    /// How many times a request is repeated after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub min_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: u32,
}

impl Default for SdoConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            retries: 3,
            min_backoff_ms: 200,
            backoff_factor: 2,
        }
    }
}

impl SdoConfig {
    /// The response timeout as a Duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The first retry delay as a Duration
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }
}

/// NMT timing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NmtConfig {
    /// Default timeout for [`crate::NmtTracker::wait_for_bootup`]
    pub bootup_timeout_ms: u64,
}

impl Default for NmtConfig {
    fn default() -> Self {
        Self {
            bootup_timeout_ms: 10_000,
        }
    }
}

impl NmtConfig {
    /// The bootup timeout as a Duration
    pub fn bootup_timeout(&self) -> Duration {
        Duration::from_millis(self.bootup_timeout_ms)
    }
}

#[derive(Deserialize)]
struct RawNetworkConfig {
    transport: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    sdo: SdoConfig,
    #[serde(default)]
    nmt: NmtConfig,
}

/// The configuration of a [`crate::Network`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// The CAN interface kind
    pub transport: TransportKind,
    /// The dispatch protocol
    pub protocol: Protocol,
    /// The interface name, required for socketcan
    pub interface: Option<String>,
    /// SDO timing, applied to every node
    pub sdo: SdoConfig,
    /// NMT timing
    pub nmt: NmtConfig,
}

impl NetworkConfig {
    /// Parse and validate a configuration
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawNetworkConfig = toml::from_str(s).context(ParseSnafu)?;
        let transport = TransportKind::from_str(&raw.transport)?;
        let protocol = match raw.protocol {
            Some(p) => Protocol::from_str(&p)?,
            None => Protocol::default(),
        };
        if transport == TransportKind::SocketCan && raw.interface.is_none() {
            return MissingParameterSnafu {
                transport: raw.transport,
                parameter: "interface",
            }
            .fail();
        }

        Ok(Self {
            transport,
            protocol,
            interface: raw.interface,
            sdo: raw.sdo,
            nmt: raw.nmt,
        })
    }

    /// Read, parse and validate a configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Self::load_from_str(&contents)
    }

    /// Open the configured socketcan interface
    #[cfg(all(feature = "socketcan", target_os = "linux"))]
    #[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
    pub fn open_socketcan(
        &self,
    ) -> Result<
        (
            canmaster_common::SocketCanSender,
            canmaster_common::SocketCanReceiver,
        ),
        ConfigError,
    > {
        use snafu::OptionExt as _;

        let interface = self.interface.as_deref().context(MissingParameterSnafu {
            transport: "socketcan",
            parameter: "interface",
        })?;
        canmaster_common::open_socketcan(interface).context(IoSnafu { path: interface })
    }
}
