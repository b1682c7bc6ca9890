//! Sweep worker
//!
//! Periodic scan for turns whose deadline passed without an action, plus
//! crash recovery for games that went terminal but never finished settling.
//! Timeouts are data (the deadline column), not scheduled callbacks; any
//! number of sweep workers can run against the same store because every
//! advance they trigger goes through the conditioned write.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::queue::{AdvanceOutcome, TurnEngine};
use super::settlement::{SettleOutcome, SettlementResolver};
use super::store::GameStore;
use crate::models::WinnerShare;

#[derive(Debug, Clone)]
pub struct SweepWorkerConfig {
    pub interval_secs: u64,
    /// Max games handled per scan per category.
    pub batch: usize,
}

impl Default for SweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            batch: 50,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub advanced: usize,
    pub settled: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct SweepWorker {
    store: GameStore,
    engine: TurnEngine,
    resolver: Arc<SettlementResolver>,
    cfg: SweepWorkerConfig,
}

impl SweepWorker {
    pub fn new(
        store: GameStore,
        engine: TurnEngine,
        resolver: Arc<SettlementResolver>,
        cfg: SweepWorkerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            resolver,
            cfg,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.cfg.interval_secs,
            batch = self.cfg.batch,
            "sweep worker started"
        );

        loop {
            interval.tick().await;
            match self.sweep_once().await {
                Ok(stats) if stats != SweepStats::default() => {
                    info!(
                        advanced = stats.advanced,
                        settled = stats.settled,
                        skipped = stats.skipped,
                        errors = stats.errors,
                        "sweep pass"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "sweep pass failed"),
            }
        }
    }

    /// One full pass: expired turns first, then settlement recovery.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = Utc::now().timestamp();

        for game_id in self.store.expired_games(now, self.cfg.batch).await? {
            match self.engine.sweep_expired(&game_id).await {
                Ok(AdvanceOutcome::Advanced { winners, .. }) => {
                    stats.advanced += 1;
                    if let Some(winners) = winners {
                        if self.try_settle(&game_id, &winners).await {
                            stats.settled += 1;
                        } else {
                            stats.errors += 1;
                        }
                    }
                }
                // Lost to a player's late action, or already handled.
                Ok(_) => stats.skipped += 1,
                Err(e) => {
                    warn!(game_id = %game_id, error = %e, "sweep advance failed");
                    stats.errors += 1;
                }
            }
        }

        // Terminal games whose settlement never completed (crash between the
        // final turn and the payout, or a retryable collaborator failure).
        for game_id in self.store.games_awaiting_settlement(self.cfg.batch).await? {
            let Some(game) = self.store.get_game(&game_id).await? else {
                continue;
            };
            let Some(winners) = game.pending_winners() else {
                continue;
            };
            if self.try_settle(&game_id, &winners).await {
                stats.settled += 1;
            } else {
                stats.errors += 1;
            }
        }

        Ok(stats)
    }

    async fn try_settle(&self, game_id: &str, winners: &[WinnerShare]) -> bool {
        match self.resolver.settle(game_id, winners).await {
            Ok(SettleOutcome::Settled { primary_tx, .. }) => {
                info!(game_id, primary_tx = %primary_tx, "sweep settled game");
                true
            }
            Ok(SettleOutcome::AlreadySettled { .. }) => {
                debug!(game_id, "game already settled");
                true
            }
            Err(e) if e.is_retryable() => {
                warn!(game_id, error = %e, "settlement failed, will retry next pass");
                false
            }
            Err(e) => {
                error!(game_id, error = %e, "settlement requires manual intervention");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::settlement::{LogNotifier, PaperAddressBook, PaperTransfer};
    use crate::models::{GameKind, GameRecord, GameStatus, TokenScope};
    use num_bigint::BigUint;

    fn temp_store() -> (tempfile::TempDir, GameStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.db");
        let store = GameStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn worker(store: &GameStore, transfers: Arc<PaperTransfer>) -> SweepWorker {
        let engine = TurnEngine::new(store.clone(), Arc::new(LogNotifier));
        let resolver = Arc::new(SettlementResolver::new(
            store.clone(),
            Arc::new(PaperAddressBook),
            transfers,
            Arc::new(LogNotifier),
        ));
        SweepWorker::new(store.clone(), engine, resolver, SweepWorkerConfig::default())
    }

    async fn overdue_knockout(store: &GameStore, players: &[&str]) -> GameRecord {
        let mut game = GameRecord::open(
            GameKind::Knockout,
            "test-community",
            TokenScope {
                chain_id: 8453,
                token_address: "0xtoken".into(),
            },
            players.iter().map(|p| p.to_string()).collect(),
            &BigUint::from(1_000u32),
            300,
        );
        game.start(Utc::now().timestamp() - 3600);
        store.insert_game(&game).await.unwrap();
        game
    }

    #[tokio::test]
    async fn sweep_drains_an_overdue_two_player_game() {
        let (_dir, store) = temp_store();
        let transfers = Arc::new(PaperTransfer::new());
        let worker = worker(&store, transfers.clone());

        // Two players, head overdue: the forfeit leaves one survivor, which
        // terminates and settles in the same pass.
        let game = overdue_knockout(&store, &["a", "b"]).await;

        let stats = worker.sweep_once().await.unwrap();
        assert_eq!(stats.advanced, 1);
        assert_eq!(stats.settled, 1);
        assert_eq!(transfers.batches(), 1);

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GameStatus::Settled);
        let records = store.settlements_for(&game.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner_id, "b");
        assert_eq!(records[0].amount, "1000");

        // Nothing left to do.
        let stats = worker.sweep_once().await.unwrap();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(transfers.batches(), 1);
    }

    #[tokio::test]
    async fn sweep_recovers_an_unsettled_terminal_game() {
        let (_dir, store) = temp_store();
        let transfers = Arc::new(PaperTransfer::new());
        let worker = worker(&store, transfers.clone());

        // Simulates a crash after the terminal turn committed but before
        // settlement ran: deadline cleared, standings durable, still
        // in_progress.
        let mut game = overdue_knockout(&store, &["a", "b"]).await;
        let original_deadline = game.turn_deadline.unwrap();
        game.current_turn = None;
        game.turn_deadline = None;
        game.variant_state = serde_json::json!({
            "pending_winners": [
                { "participant_id": "a", "amount": "1000", "position": 1 }
            ]
        });
        assert!(store.commit_advance(&game, original_deadline).await.unwrap());

        let stats = worker.sweep_once().await.unwrap();
        assert_eq!(stats.settled, 1);
        assert_eq!(transfers.batches(), 1);

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GameStatus::Settled);
    }
}
