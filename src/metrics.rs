//! Process-level gauges, registered against the default Prometheus
//! registry the way this workspace's services expose `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge};

pub static CONNECTED_PEERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "wal_broadcaster_connected_peers",
        "Number of safekeepers that have accepted our candidacy"
    )
    .expect("failed to register wal_broadcaster_connected_peers")
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "wal_broadcaster_queue_depth",
        "Number of WAL messages awaiting full acknowledgement"
    )
    .expect("failed to register wal_broadcaster_queue_depth")
});

pub static COMMITTED_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "wal_broadcaster_committed_lsn",
        "Highest LSN acknowledged by quorum-many safekeepers"
    )
    .expect("failed to register wal_broadcaster_committed_lsn")
});
