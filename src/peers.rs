//! C3 — Peer Directory: the set of currently reachable peer node ids,
//! sourced from the BATMAN-adv originator table and cached for up to
//! `peer_refresh_interval_ms`. Falls back to a static list when `batctl`
//! isn't available, the same way the teacher's UWB hub logs a missing
//! socket and carries on instead of failing the whole process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;

struct DirectoryState {
    peers: Vec<String>,
    refreshed_at: Instant,
}

pub struct PeerDirectory {
    self_node_id: String,
    refresh_interval: Duration,
    static_peers: Vec<String>,
    state: RwLock<DirectoryState>,
}

impl PeerDirectory {
    pub fn new(self_node_id: String, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            self_node_id,
            refresh_interval: Duration::from_millis(config.peer_refresh_interval_ms),
            static_peers: config.static_peers.clone(),
            state: RwLock::new(DirectoryState {
                peers: Vec::new(),
                refreshed_at: Instant::now() - Duration::from_secs(3600),
            }),
        })
    }

    /// Currently reachable peers, excluding self. May be stale by up to the
    /// configured refresh interval.
    pub async fn list_peers(&self) -> Vec<String> {
        {
            let state = self.state.read().await;
            if state.refreshed_at.elapsed() < self.refresh_interval {
                return state.peers.clone();
            }
        }
        self.refresh().await
    }

    pub async fn node_list(&self) -> Vec<String> {
        let mut out = vec![self.self_node_id.clone()];
        out.extend(self.list_peers().await);
        out
    }

    async fn refresh(&self) -> Vec<String> {
        let discovered = discover_via_batctl().await.unwrap_or_else(|| {
            debug!("batctl unavailable, falling back to static peer list");
            self.static_peers.clone()
        });

        let peers: Vec<String> = discovered
            .into_iter()
            .filter(|p| p != &self.self_node_id)
            .collect();

        let mut state = self.state.write().await;
        state.peers = peers.clone();
        state.refreshed_at = Instant::now();
        peers
    }
}

/// Parse `batctl o -H -n` output for reachable originator IPv4 addresses.
/// Returns `None` (rather than an empty directory) when the binary itself
/// can't be run, so callers can distinguish "no peers" from "no mesh".
async fn discover_via_batctl() -> Option<Vec<String>> {
    let output = match Command::new("batctl").args(["o", "-H", "-n"]).output().await {
        Ok(o) => o,
        Err(e) => {
            warn!("batctl not available: {e}");
            return None;
        }
    };

    if !output.status.success() {
        warn!("batctl exited with {:?}", output.status);
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_originator_table(&text))
}

fn parse_originator_table(text: &str) -> Vec<String> {
    let mut peers = Vec::new();
    for line in text.lines() {
        for token in line.split_whitespace() {
            if token.parse::<std::net::Ipv4Addr>().is_ok() {
                peers.push(token.to_string());
                break;
            }
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_tokens_from_batctl_output() {
        let sample = "169.254.10.20 0.512s   (255) aa:bb:cc:dd:ee:ff [bat0]\n\
                       169.254.10.21 1.024s   (200) 11:22:33:44:55:66 [bat0]\n";
        let peers = parse_originator_table(sample);
        assert_eq!(peers, vec!["169.254.10.20", "169.254.10.21"]);
    }

    #[test]
    fn ignores_lines_with_no_ip() {
        let sample = "Originator table not available\n";
        assert!(parse_originator_table(sample).is_empty());
    }
}
