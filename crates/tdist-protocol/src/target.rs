use std::fmt;

/// The only protocol a tdist server speaks.
pub const GRPC_PROTOCOL: &str = "grpc";

/// Reasons a `host:port` address or a session target fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    MissingPort(String),
    InvalidPort(String),
    EmptyHost(String),
    MissingScheme(String),
    UnknownProtocol(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort(addr) => write!(f, "address '{addr}' has no port (expected host:port)"),
            Self::InvalidPort(addr) => write!(f, "address '{addr}' has a non-numeric port"),
            Self::EmptyHost(addr) => write!(f, "address '{addr}' has an empty host"),
            Self::MissingScheme(target) => {
                write!(f, "target '{target}' is not of the form <protocol>://host:port")
            }
            Self::UnknownProtocol(protocol) => write!(f, "no server protocol named '{protocol}'"),
        }
    }
}

impl std::error::Error for AddressError {}

/// Split a `host:port` address. Port `0` is accepted and means "ephemeral".
pub fn parse_address(address: &str) -> Result<(String, u16), AddressError> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(AddressError::MissingPort(address.to_string()));
    };
    if host.is_empty() {
        return Err(AddressError::EmptyHost(address.to_string()));
    }
    if port.is_empty() {
        return Err(AddressError::MissingPort(address.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))?;
    Ok((host.to_string(), port))
}

/// A parsed session target, `<protocol>://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let Some((protocol, address)) = raw.split_once("://") else {
            return Err(AddressError::MissingScheme(raw.to_string()));
        };
        if protocol != GRPC_PROTOCOL {
            return Err(AddressError::UnknownProtocol(protocol.to_string()));
        }
        let (host, port) = parse_address(address)?;
        Ok(Self {
            protocol: protocol.to_string(),
            host,
            port,
        })
    }

    /// `host:port` part of the target, suitable for a socket connect.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}
