//! C5 — Pull Scheduler: the heart of the core. Drives one incremental tick
//! per peer per tick interval, sequencing a forward then a backward
//! windowed pull per peer, committing both atomically with the peer's
//! advanced cursors, and recovering peer-local failures without touching
//! other peers' cursors.
//!
//! Outer loop shape mirrors the teacher's `main.rs::run_engine_tick`
//! (`tokio::spawn`'d `tokio::time::interval` loop driving a per-tick state
//! transition); the in-flight-peer guard mirrors `handlers.rs`'s
//! `DeadBoats = Arc<RwLock<HashSet<String>>>` pattern, repurposed from
//! tracking disconnected boats to tracking peers whose round hasn't
//! returned yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::http_client::PeerClient;
use crate::peers::PeerDirectory;
use crate::store::LocationStore;
use crate::sync_log::SyncLog;
use crate::time::now_ms;

#[derive(Debug, Serialize, Clone)]
pub struct PeerRoundError {
    pub node_id: String,
    pub error: String,
}

#[derive(Debug, Serialize, Default)]
pub struct TickSummary {
    pub synced: usize,
    pub total: usize,
    pub total_count: usize,
    pub errors: Vec<PeerRoundError>,
}

struct RoundOutcome {
    peer_id: String,
    received_count: usize,
    /// Per-report conflicts encountered during an otherwise-successful
    /// commit (spec §8 scenario 6) — surfaced alongside a round-level
    /// `error`, never in place of one.
    conflicts: Vec<String>,
    error: Option<String>,
}

// ─── Pure cursor math (spec §4.5's window advancement, extracted for testing) ──

/// Forward window's upper bound: advance by `window`, never past `now`.
fn forward_window_to(forward_cursor_ms: i64, window: i64, now: i64) -> i64 {
    (forward_cursor_ms + window).min(now)
}

/// Backward window's lower bound: retreat by `window`, never below zero.
fn backward_window_from(backward_cursor_ms: i64, window: i64) -> i64 {
    (backward_cursor_ms - window).max(0)
}

/// Next forward cursor. An empty pull still advances the cursor to the
/// window's upper bound (spec §4.5: "no data in range" still counts as
/// covered ground); a non-empty pull advances to the newest timestamp seen,
/// never retreating below the cursor's current value.
fn advance_forward_cursor(forward_cursor_ms: i64, window_to: i64, received: &[i64]) -> i64 {
    match received.iter().copied().max() {
        None => window_to,
        Some(max_seen) => max_seen.max(forward_cursor_ms),
    }
}

/// Next backward cursor, mirroring [`advance_forward_cursor`] in the other
/// direction: an empty pull retreats to the window's lower bound; a
/// non-empty pull retreats to the oldest timestamp seen, never advancing
/// past the cursor's current value.
fn advance_backward_cursor(backward_cursor_ms: i64, window_from: i64, received: &[i64]) -> i64 {
    match received.iter().copied().min() {
        None => window_from,
        Some(min_seen) => min_seen.min(backward_cursor_ms),
    }
}

pub struct Scheduler {
    store: LocationStore,
    sync_log: SyncLog,
    directory: Arc<PeerDirectory>,
    client: PeerClient,
    config: Config,
    self_node_id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: LocationStore,
        sync_log: SyncLog,
        directory: Arc<PeerDirectory>,
        client: PeerClient,
        config: Config,
        self_node_id: String,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sync_log,
            directory,
            client,
            config,
            self_node_id,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        })
    }

    /// Background tick loop. Runs until the cancellation token fires; the
    /// next tick starts `tick_interval_ms` after the previous tick's last
    /// sub-task completed (never overlapping globally).
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                info!("scheduler: stop signal received, exiting tick loop");
                return;
            }

            let summary = self.tick().await;
            if summary.total > 0 {
                info!(
                    "tick complete: synced={} total={} reports={} errors={}",
                    summary.synced,
                    summary.total,
                    summary.total_count,
                    summary.errors.len()
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.tick_interval_ms)) => {}
                _ = self.cancel.cancelled() => {
                    info!("scheduler: stop signal received during idle wait");
                    return;
                }
            }
        }
    }

    /// One incremental tick across every currently reachable peer. Peers
    /// whose previous round is still outstanding are skipped this tick
    /// (spec §4.5: "a round never re-enters").
    pub async fn tick(self: &Arc<Self>) -> TickSummary {
        let peers = self.directory.list_peers().await;
        if peers.is_empty() {
            return TickSummary::default();
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_peer_syncs.max(1)));
        let mut handles = Vec::with_capacity(peers.len());

        for peer_id in peers.clone() {
            let already_running = {
                let mut guard = self.in_flight.lock().await;
                if guard.contains(&peer_id) {
                    true
                } else {
                    guard.insert(peer_id.clone());
                    false
                }
            };
            if already_running {
                continue;
            }

            let this = Arc::clone(self);
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let outcome = this.sync_peer_incremental(&peer_id).await;
                this.in_flight.lock().await.remove(&peer_id);
                outcome
            }));
        }

        let mut summary = TickSummary {
            total: handles.len(),
            ..Default::default()
        };

        for handle in handles {
            match handle.await {
                Ok(outcome) => merge_outcome(&mut summary, outcome),
                Err(e) => warn!("peer sync task panicked: {e}"),
            }
        }

        summary
    }

    /// Forward pull → backward pull → single commit, for one peer. Cursors
    /// are left untouched and the error recorded when either pull or the
    /// commit fails; no error propagates to other peers.
    async fn sync_peer_incremental(&self, peer_id: &str) -> RoundOutcome {
        let started = Instant::now();
        let round_timeout = Duration::from_millis(self.config.per_round_timeout_ms);

        let result = tokio::time::timeout(round_timeout, self.run_round(peer_id)).await;

        match result {
            Ok(Ok((received, conflicts))) => {
                info!(
                    peer_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    received_count = received,
                    conflict_count = conflicts.len(),
                    outcome = "ok",
                    "sync round complete"
                );
                RoundOutcome {
                    peer_id: peer_id.to_string(),
                    received_count: received,
                    conflicts,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(
                    peer_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    outcome = "error",
                    error = %e,
                    "sync round failed"
                );
                RoundOutcome {
                    peer_id: peer_id.to_string(),
                    received_count: 0,
                    conflicts: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!(peer_id, outcome = "timeout", "sync round timed out");
                RoundOutcome {
                    peer_id: peer_id.to_string(),
                    received_count: 0,
                    conflicts: Vec::new(),
                    error: Some("round timed out".to_string()),
                }
            }
        }
    }

    async fn run_round(&self, peer_id: &str) -> Result<(usize, Vec<String>), CoreError> {
        let state = self.sync_log.get_or_init(peer_id).await?;
        let now = now_ms();
        let window = self.config.sliding_window_ms;

        let forward_to = forward_window_to(state.forward_cursor_ms, window, now);
        let backward_from = backward_window_from(state.backward_cursor_ms, window);

        let forward_reports = self
            .client
            .fetch_range(peer_id, peer_id, state.forward_cursor_ms, forward_to)
            .await?;

        let backward_reports = self
            .client
            .fetch_range(peer_id, peer_id, backward_from, state.backward_cursor_ms)
            .await?;

        let forward_timestamps: Vec<i64> = forward_reports.iter().map(|r| r.created_at).collect();
        let backward_timestamps: Vec<i64> = backward_reports.iter().map(|r| r.created_at).collect();

        let new_forward_cursor =
            advance_forward_cursor(state.forward_cursor_ms, forward_to, &forward_timestamps);
        let new_backward_cursor =
            advance_backward_cursor(state.backward_cursor_ms, backward_from, &backward_timestamps);

        let mut all_reports = forward_reports;
        all_reports.extend(backward_reports);
        let received_count = all_reports.len();

        let conflicts = self
            .commit_round(peer_id, &all_reports, new_forward_cursor, new_backward_cursor)
            .await?;

        Ok((received_count, conflicts))
    }

    /// Insert every pulled report and upsert this peer's cursors inside one
    /// transaction. Duplicate reports across the forward/backward windows
    /// are absorbed by `insert_tx`'s `AlreadyPresent` path; a conflicting
    /// report is skipped without aborting the rest of the round, and its
    /// id is returned so the caller can surface it in the round's errors.
    async fn commit_round(
        &self,
        peer_id: &str,
        reports: &[crate::store::LocationReport],
        forward_cursor_ms: i64,
        backward_cursor_ms: i64,
    ) -> Result<Vec<String>, CoreError> {
        let mut tx = self.store.pool().begin().await?;
        let mut conflicts = Vec::new();

        for report in reports {
            match LocationStore::insert_tx(&mut tx, report).await {
                Ok(_) => {}
                Err(CoreError::ReportConflict { id }) => {
                    warn!(peer_id, report_id = %id, "rejected conflicting report from peer");
                    conflicts.push(format!("report {id} conflicts with stored contents"));
                }
                Err(e) => return Err(e),
            }
        }

        SyncLog::put_tx(&mut tx, peer_id, forward_cursor_ms, backward_cursor_ms, "ok").await?;

        tx.commit().await?;
        Ok(conflicts)
    }

    /// Operator-triggered deep pull: saturate an explicit range for every
    /// peer concurrently, bypassing the sliding window.
    pub async fn deep_sync(self: &Arc<Self>, start_ms: i64, end_ms: i64) -> TickSummary {
        let peers = self.directory.list_peers().await;
        let mut handles = Vec::with_capacity(peers.len());

        for peer_id in peers {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                this.deep_sync_peer(&peer_id, start_ms, end_ms).await
            }));
        }

        let mut summary = TickSummary {
            total: handles.len(),
            ..Default::default()
        };
        for handle in handles {
            match handle.await {
                Ok(outcome) => merge_outcome(&mut summary, outcome),
                Err(e) => warn!("deep sync task panicked: {e}"),
            }
        }
        summary
    }

    async fn deep_sync_peer(&self, peer_id: &str, start_ms: i64, end_ms: i64) -> RoundOutcome {
        match self.client.fetch_range(peer_id, peer_id, start_ms, end_ms).await {
            Ok(reports) => {
                let received_count = reports.len();
                let timestamps: Vec<i64> = reports.iter().map(|r| r.created_at).collect();
                let fwd = advance_forward_cursor(start_ms, end_ms, &timestamps);
                let bwd = advance_backward_cursor(end_ms, start_ms, &timestamps);
                match self.commit_round(peer_id, &reports, fwd, bwd).await {
                    Ok(conflicts) => RoundOutcome {
                        peer_id: peer_id.to_string(),
                        received_count,
                        conflicts,
                        error: None,
                    },
                    Err(e) => RoundOutcome {
                        peer_id: peer_id.to_string(),
                        received_count: 0,
                        conflicts: Vec::new(),
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => RoundOutcome {
                peer_id: peer_id.to_string(),
                received_count: 0,
                conflicts: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn diagnostics(&self) -> Result<Vec<crate::sync_log::PeerDiagnostics>, CoreError> {
        let stats = self.store.stats().await?;
        let counts: HashMap<String, i64> = stats.per_node;
        self.sync_log.all(&counts).await
    }

    pub fn self_node_id(&self) -> &str {
        &self.self_node_id
    }
}

fn merge_outcome(summary: &mut TickSummary, outcome: RoundOutcome) {
    summary.total_count += outcome.received_count;
    for conflict in outcome.conflicts {
        summary.errors.push(PeerRoundError {
            node_id: outcome.peer_id.clone(),
            error: conflict,
        });
    }
    match outcome.error {
        None => summary.synced += 1,
        Some(error) => summary.errors.push(PeerRoundError {
            node_id: outcome.peer_id,
            error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_advances_to_bound_when_pull_is_empty() {
        let to = forward_window_to(1_000, 500, 10_000);
        assert_eq!(to, 1_500);
        assert_eq!(advance_forward_cursor(1_000, to, &[]), 1_500);

        let from = backward_window_from(5_000, 500);
        assert_eq!(from, 4_500);
        assert_eq!(advance_backward_cursor(5_000, from, &[]), 4_500);
    }

    #[test]
    fn forward_cursor_never_exceeds_now() {
        let to = forward_window_to(9_800, 500, 10_000);
        assert_eq!(to, 10_000);
        assert_eq!(advance_forward_cursor(9_800, to, &[]), 10_000);
    }

    #[test]
    fn backward_cursor_never_goes_below_zero() {
        let from = backward_window_from(200, 500);
        assert_eq!(from, 0);
        assert_eq!(advance_backward_cursor(200, from, &[]), 0);
    }

    #[test]
    fn forward_cursor_advances_to_newest_seen_timestamp() {
        let to = forward_window_to(1_000, 500, 10_000);
        let advanced = advance_forward_cursor(1_000, to, &[1_100, 1_450, 1_200]);
        assert_eq!(advanced, 1_450);
    }

    #[test]
    fn backward_cursor_retreats_to_oldest_seen_timestamp() {
        let from = backward_window_from(5_000, 500);
        let advanced = advance_backward_cursor(5_000, from, &[4_700, 4_550, 4_900]);
        assert_eq!(advanced, 4_550);
    }

    #[test]
    fn forward_cursor_is_monotonic_across_empty_and_nonempty_rounds() {
        let mut cursor = 0i64;
        let now = 100_000i64;
        let window = 1_000i64;

        for round_reports in [vec![], vec![300, 900], vec![], vec![1_950]] {
            let to = forward_window_to(cursor, window, now);
            let next = advance_forward_cursor(cursor, to, &round_reports);
            assert!(next >= cursor, "cursor must never retreat");
            cursor = next;
        }
        assert!(cursor > 0);
    }

    #[test]
    fn backward_cursor_is_monotonic_across_empty_and_nonempty_rounds() {
        let mut cursor = 10_000i64;
        let window = 1_000i64;

        for round_reports in [vec![], vec![9_500, 9_100], vec![], vec![7_800]] {
            let from = backward_window_from(cursor, window);
            let next = advance_backward_cursor(cursor, from, &round_reports);
            assert!(next <= cursor, "cursor must never advance backwards in reverse");
            cursor = next;
        }
        assert!(cursor < 10_000);
    }

    #[test]
    fn repeated_empty_rounds_converge_forward_cursor_to_now() {
        let mut cursor = 0i64;
        let now = 3_000i64;
        let window = 1_000i64;

        for _ in 0..10 {
            let to = forward_window_to(cursor, window, now);
            cursor = advance_forward_cursor(cursor, to, &[]);
        }
        assert_eq!(cursor, now);
    }
}
