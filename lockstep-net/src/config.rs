//! Network configuration types.

use std::{
    fmt::Formatter,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::NetworkError;

/// A `host:port` pair.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// The hostname or IP address.
    pub hostname: String,
    /// The port.
    pub port: u16,
}

impl Address {
    /// Construct a new [`Address`].
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl ToSocketAddrs for Address {
    type Iter = std::vec::IntoIter<SocketAddr>;
    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        format!("{}:{}", self.hostname, self.port).to_socket_addrs()
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}:{}", self.hostname, self.port))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(serde::de::Error::custom("invalid address format"));
        }
        let hostname = parts[0].to_string();
        let port = parts[1].parse().map_err(serde::de::Error::custom)?;
        Ok(Address { hostname, port })
    }
}

/// A party in the network.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct NetworkParty {
    /// The id of the party, 1-based.
    pub id: usize,
    /// The address of the party.
    pub address: Address,
}

impl NetworkParty {
    /// Construct a new [`NetworkParty`].
    pub fn new(id: usize, address: Address) -> Self {
        Self { id, address }
    }
}

/// The network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkConfig {
    /// The list of parties in the network.
    pub parties: Vec<NetworkParty>,
    /// Our own id in the network.
    pub my_id: usize,
    /// The [SocketAddr] we bind to.
    pub bind_addr: SocketAddr,
    /// The connection-setup and receive timeout.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// The max length (in bytes) of a single frame.
    #[serde(default)]
    pub max_frame_length: Option<usize>,
}

impl NetworkConfig {
    /// Construct a new [`NetworkConfig`].
    pub fn new(id: usize, bind_addr: SocketAddr, parties: Vec<NetworkParty>) -> Self {
        Self {
            parties,
            my_id: id,
            bind_addr,
            timeout: None,
            max_frame_length: None,
        }
    }

    /// Sanity check the config: party ids must be dense `1..=N`, unique, and
    /// include `my_id`. The 1-byte identity handshake caps the network at
    /// 255 parties, and the 4-byte frame header caps `max_frame_length` at
    /// [`u32::MAX`].
    pub fn check(&self) -> Result<(), NetworkError> {
        let n = self.parties.len();
        if n == 0 {
            return Err(NetworkError::InvalidConfig(
                "party list is empty".to_string(),
            ));
        }
        if n > u8::MAX as usize {
            return Err(NetworkError::InvalidConfig(format!(
                "at most {} parties are supported, got {n}",
                u8::MAX
            )));
        }
        let mut ids = self.parties.iter().map(|p| p.id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != n {
            return Err(NetworkError::InvalidConfig(
                "duplicate party ids found".to_string(),
            ));
        }
        if ids.first() != Some(&1) || ids.last() != Some(&n) {
            return Err(NetworkError::InvalidConfig(format!(
                "party ids must be dense 1..={n}, got {ids:?}"
            )));
        }
        if !(1..=n).contains(&self.my_id) {
            return Err(NetworkError::InvalidConfig(format!(
                "my_id {} not found in list of parties",
                self.my_id
            )));
        }
        // frame lengths travel in a 4-byte header
        if let Some(max) = self.max_frame_length {
            if max > u32::MAX as usize {
                return Err(NetworkError::InvalidConfig(format!(
                    "max_frame_length {max} exceeds the 4-byte frame header limit {}",
                    u32::MAX
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ids: &[usize], my_id: usize) -> NetworkConfig {
        let parties = ids
            .iter()
            .map(|&id| NetworkParty::new(id, Address::new("127.0.0.1", 9000 + id as u16)))
            .collect();
        NetworkConfig::new(my_id, "127.0.0.1:9001".parse().unwrap(), parties)
    }

    #[test]
    fn accepts_dense_ids() {
        config(&[1, 2, 3], 2).check().unwrap();
        config(&[1], 1).check().unwrap();
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(config(&[], 1).check().is_err());
        assert!(config(&[1, 1, 2], 1).check().is_err());
        assert!(config(&[0, 1, 2], 1).check().is_err());
        assert!(config(&[1, 2, 4], 1).check().is_err());
        assert!(config(&[1, 2, 3], 4).check().is_err());
    }

    #[test]
    fn rejects_frame_limits_beyond_the_header() {
        let mut cfg = config(&[1, 2], 1);
        cfg.max_frame_length = Some(u32::MAX as usize);
        cfg.check().unwrap();
        cfg.max_frame_length = Some(u32::MAX as usize + 1);
        assert!(cfg.check().is_err());
    }

    #[test]
    fn parses_toml() {
        let config: NetworkConfig = toml::from_str(
            r#"
            my_id = 1
            bind_addr = "0.0.0.0:10000"
            timeout = "30s"

            [[parties]]
            id = 1
            address = "localhost:10000"

            [[parties]]
            id = 2
            address = "localhost:10001"
            "#,
        )
        .unwrap();
        config.check().unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.parties[1].address, Address::new("localhost", 10001));
        assert_eq!(config.parties[1].address.to_string(), "localhost:10001");
    }
}
