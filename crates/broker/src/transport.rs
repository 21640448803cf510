use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Transport layer for ZeroMQ connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket. A bare name maps under `/tmp/sensorflow/`,
    /// an absolute path is used as is.
    Ipc(String),

    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a `tcp://host:port` or `ipc://name` URL.
    pub fn parse(url: &str) -> Result<Self, BrokerError> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| BrokerError::InvalidUrl(format!("{url}: missing port")))?;
            if host.is_empty() {
                return Err(BrokerError::InvalidUrl(format!("{url}: missing host")));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| BrokerError::InvalidUrl(format!("{url}: bad port '{port}'")))?;
            Ok(Self::tcp(host, port))
        } else if let Some(name) = url.strip_prefix("ipc://") {
            if name.is_empty() {
                return Err(BrokerError::InvalidUrl(format!("{url}: missing socket name")));
            }
            Ok(Self::ipc(name))
        } else {
            Err(BrokerError::InvalidUrl(url.to_string()))
        }
    }

    /// The endpoint next to this one: TCP port + 1, or `<name>-backend` for IPC.
    ///
    /// Used as the proxy backend when none is configured.
    pub fn paired(&self) -> Self {
        match self {
            Self::Tcp { host, port } => Self::tcp(host.clone(), port.wrapping_add(1)),
            Self::Ipc(name) => match name.strip_suffix(".sock") {
                Some(stem) => Self::Ipc(format!("{stem}-backend.sock")),
                None => Self::Ipc(format!("{name}-backend")),
            },
        }
    }

    /// Generate the ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) if name.starts_with('/') => format!("ipc://{name}"),
            Self::Ipc(name) => format!("ipc:///tmp/sensorflow/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// For IPC transports, ensure the parent directory exists.
    ///
    /// ZeroMQ requires the directory to exist before binding an IPC socket.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a stale IPC socket file left over from a previous run.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path, "removed stale IPC socket");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn ipc_path(&self) -> Option<String> {
        match self {
            Self::Ipc(_) => {
                let endpoint = self.endpoint();
                endpoint.strip_prefix("ipc://").map(str::to_string)
            }
            Self::Tcp { .. } => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// A parsed broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerUrl {
    /// `memory://<name>`
    Memory(String),
    /// `tcp://…` or `ipc://…`
    Zmq(Transport),
}

impl BrokerUrl {
    pub fn parse(url: &str) -> Result<Self, BrokerError> {
        match url.strip_prefix("memory://") {
            Some("") => Err(BrokerError::InvalidUrl(format!("{url}: missing broker name"))),
            Some(name) => Ok(Self::Memory(name.to_string())),
            None => Transport::parse(url).map(Self::Zmq),
        }
    }
}
