//! HTTP/1.1 upgrade bridging
//!
//! exec, attach, port-forward and watch-style streams switch protocols.
//! The upgrade handshake is forwarded untouched and, once both sides have
//! switched, the raw byte streams are bridged without parsing frames.

use axum::http::{header, HeaderMap};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

/// Whether a request asks to switch protocols
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Bridge two upgraded connections on a background task
///
/// The task ends when either side closes.
pub fn spawn_bridge(cluster_id: String, inbound: OnUpgrade, outbound: OnUpgrade) {
    tokio::spawn(async move {
        let (inbound, outbound) = match tokio::try_join!(inbound, outbound) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "Failed to complete upgrade");
                return;
            }
        };

        let mut client = TokioIo::new(inbound);
        let mut server = TokioIo::new(outbound);
        match tokio::io::copy_bidirectional(&mut client, &mut server).await {
            Ok((from_client, from_server)) => {
                info!(cluster = %cluster_id, from_client, from_server, "Upgraded session ended");
            }
            Err(e) => {
                debug!(cluster = %cluster_id, error = %e, "Upgraded session bridge error");
            }
        }
    });
}
