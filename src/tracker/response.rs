use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::PeerId;

/// A single peer offered by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct PeerAddr {
    #[serde(with = "peer_id_hex")]
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
}

/// The tracker's JSON announce response: `{interval: seconds, peers: [...]}`
/// (spec §6).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct TrackerResponse {
    #[serde(with = "interval_secs")]
    pub interval: Duration,
    #[serde(default)]
    pub peers: Vec<PeerAddr>,
}

/// (De)serializes a [`PeerId`] as a hex string, since JSON has no native
/// byte-string type.
mod peer_id_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::PeerId;

    pub fn serialize<S>(id: &PeerId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(id))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PeerId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let mut id = [0u8; 20];
        if bytes.len() != id.len() {
            return Err(serde::de::Error::custom("peer_id must be 20 bytes"));
        }
        id.copy_from_slice(&bytes);
        Ok(id)
    }
}

/// (De)serializes the `interval` field as a whole number of seconds.
mod interval_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
