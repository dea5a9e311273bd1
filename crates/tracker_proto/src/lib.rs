//! BEP-15 UDP tracker wire protocol.

pub mod tracker_comms_udp;

pub use tracker_comms_udp::{
    AnnounceFields, AnnounceResponse, ConnectionId, Request, Response, TransactionId,
    UdpTrackerRequester, decode_compact_peers_v4, decode_compact_peers_v6,
    encode_compact_peers_v4, new_transaction_id, EVENT_COMPLETED, EVENT_NONE, EVENT_PAUSED,
    EVENT_STARTED, EVENT_STOPPED,
};
