//! Session configuration (§6, §10): a typed `Config` plus a "proplists as config" constructor
//! that rejects unknown keys, mirroring the teacher's `SessionOptions` builder.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::choker::MaxUploadSlots;

/// The exact configuration surface the engine exposes to its collaborator (a CLI, a web UI,
/// whatever parses the on-disk config file). Everything else about config file parsing is out
/// of scope; this struct is what a parser is expected to produce.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub listen_ip: Option<IpAddr>,
    pub max_upload_slots: MaxUploadSlots,
    pub max_upload_rate: Option<u32>,
    pub max_download_rate: Option<u32>,
    pub optimistic_slots: usize,
    pub dht: bool,
    pub dht_port: Option<u16>,
    pub download_dir: PathBuf,
    pub dotdir: PathBuf,
    pub max_peers: usize,

    /// Session-level tunables not in the key table above but exposed alongside it, the way the
    /// teacher bundles `PeerConnectionOptions` next to `SessionOptions`.
    pub pipeline_depth: usize,
    pub rechoke_round: Duration,
    pub endgame_replication_factor: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 4240,
            listen_ip: None,
            max_upload_slots: MaxUploadSlots::Auto {
                max_upload_rate_kbps: 0,
            },
            max_upload_rate: None,
            max_download_rate: None,
            optimistic_slots: 1,
            dht: false,
            dht_port: None,
            download_dir: PathBuf::from("."),
            dotdir: PathBuf::from(".session"),
            max_peers: 50,
            pipeline_depth: 5,
            rechoke_round: Duration::from_secs(10),
            endgame_replication_factor: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration key {0:?}")]
    UnknownKey(String),
    #[error("invalid value for key {key:?}: {message}")]
    InvalidValue { key: String, message: String },
}

const KNOWN_KEYS: &[&str] = &[
    "listen_port",
    "listen_ip",
    "max_upload_slots",
    "max_upload_rate",
    "max_download_rate",
    "optimistic_slots",
    "dht",
    "dht_port",
    "download_dir",
    "dotdir",
    "max_peers",
];

impl Config {
    /// Builds a `Config` from a generic string-keyed map, rejecting any key not in
    /// [`KNOWN_KEYS`]. Values are parsed leniently (e.g. `"auto"` for `max_upload_slots`) the
    /// way the teacher's proplist-style options accept either a fixed number or a sentinel.
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Result<Self, ConfigError> {
        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        let mut cfg = Config::default();

        if let Some(v) = map.get("listen_port") {
            cfg.listen_port = parse_field("listen_port", v)?;
        }
        if let Some(v) = map.get("listen_ip") {
            cfg.listen_ip = Some(parse_field("listen_ip", v)?);
        }
        if let Some(v) = map.get("max_upload_slots") {
            cfg.max_upload_slots = if v == "auto" {
                MaxUploadSlots::Auto {
                    max_upload_rate_kbps: cfg.max_upload_rate.unwrap_or(0),
                }
            } else {
                MaxUploadSlots::Fixed(parse_field("max_upload_slots", v)?)
            };
        }
        if let Some(v) = map.get("max_upload_rate") {
            cfg.max_upload_rate = Some(parse_field("max_upload_rate", v)?);
        }
        if let Some(v) = map.get("max_download_rate") {
            cfg.max_download_rate = Some(parse_field("max_download_rate", v)?);
        }
        if let Some(v) = map.get("optimistic_slots") {
            cfg.optimistic_slots = parse_field("optimistic_slots", v)?;
        }
        if let Some(v) = map.get("dht") {
            cfg.dht = parse_field("dht", v)?;
        }
        if let Some(v) = map.get("dht_port") {
            cfg.dht_port = Some(parse_field("dht_port", v)?);
        }
        if let Some(v) = map.get("download_dir") {
            cfg.download_dir = PathBuf::from(v);
        }
        if let Some(v) = map.get("dotdir") {
            cfg.dotdir = PathBuf::from(v);
        }
        if let Some(v) = map.get("max_peers") {
            cfg.max_peers = parse_field("max_peers", v)?;
        }

        Ok(cfg)
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("can't parse {value:?}"),
    })
}
