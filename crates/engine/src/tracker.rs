//! Tracker tier announcer (§4.1, §C1): drives one [`UdpTrackerRequester`] per tracker URL in a
//! BEP-12 tier and folds the response into the registry.
//!
//! Tier semantics: try trackers in order; on success, promote the winner to the front of its
//! tier so subsequent announces prefer it. A tier is exhausted once every tracker in it has
//! failed this round; the caller decides the backoff (tracker HTTP/backoff policy is out of
//! scope here, see the storage collaborator note in `storage.rs` for the analogous split).

use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::Context;
use core_types::Id20;
use tracker_proto::{AnnounceFields, Response, UdpTrackerRequester, EVENT_NONE};

use crate::registry::{Alteration, Registry};
use crate::type_aliases::TorrentId;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct AnnounceTier {
    pub urls: Vec<String>,
}

impl AnnounceTier {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    /// Move the tracker at `idx` to the front, so it's preferred on the next announce.
    fn promote(&mut self, idx: usize) {
        if idx != 0 {
            self.urls.swap(0, idx);
        }
    }
}

pub struct AnnounceOutcome {
    pub interval: Duration,
    pub peers: Vec<SocketAddrV4>,
}

/// Announces to the first reachable tracker in `tier`, recording seeder/leecher counts on the
/// registry entry. Returns the peer list from whichever tracker answered.
pub async fn announce_tier(
    tier: &mut AnnounceTier,
    torrent_id: TorrentId,
    registry: &Registry,
    info_hash: Id20,
    peer_id: Id20,
    port: u16,
    downloaded: u64,
    left: u64,
    uploaded: u64,
    event: u32,
) -> anyhow::Result<AnnounceOutcome> {
    let mut last_err = None;
    for (idx, url) in tier.urls.iter().enumerate() {
        let host = url
            .strip_prefix("udp://")
            .unwrap_or(url)
            .trim_end_matches('/');
        match try_one(host, info_hash, peer_id, port, downloaded, left, uploaded, event).await {
            Ok(outcome) => {
                let _ = registry.apply(
                    torrent_id,
                    &[Alteration::TrackerReport {
                        seeders: outcome.seeders,
                        leechers: outcome.leechers,
                    }],
                );
                tier.promote(idx);
                return Ok(AnnounceOutcome {
                    interval: Duration::from_secs(outcome.interval as u64),
                    peers: outcome.peers,
                });
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "tracker announce failed, trying next in tier");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("empty tracker tier")))
}

struct RawOutcome {
    interval: u32,
    seeders: u32,
    leechers: u32,
    peers: Vec<SocketAddrV4>,
}

async fn try_one(
    host_port: &str,
    info_hash: Id20,
    peer_id: Id20,
    port: u16,
    downloaded: u64,
    left: u64,
    uploaded: u64,
    event: u32,
) -> anyhow::Result<RawOutcome> {
    let mut requester = UdpTrackerRequester::new(host_port)
        .await
        .context("connecting to tracker")?;
    let fields = AnnounceFields {
        info_hash,
        peer_id,
        downloaded,
        left,
        uploaded,
        event: if event == u32::MAX { EVENT_NONE } else { event },
        key: rand::random(),
        port,
    };
    let response = requester.announce(fields).await.context("announce")?;
    Ok(RawOutcome {
        interval: response.interval,
        seeders: response.seeders,
        leechers: response.leechers,
        peers: response.addrs,
    })
}

/// Only present so `Response` stays reachable from callers building their own scrape logic on
/// top of this module without re-importing `tracker_proto` directly.
pub type RawResponse = Response;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_moves_winner_to_front() {
        let mut tier = AnnounceTier::new(vec![
            "udp://a:1".into(),
            "udp://b:2".into(),
            "udp://c:3".into(),
        ]);
        tier.promote(2);
        assert_eq!(tier.urls[0], "udp://c:3");
    }
}
