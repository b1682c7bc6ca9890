//! Game store
//!
//! SQLite persistence for games, the append-only event log, and write-once
//! settlement records. The store is the only synchronization point between
//! competing workers: every turn advance goes through `commit_advance`,
//! a single conditional UPDATE whose affected-row count tells the caller
//! whether it won or lost the race for the current deadline.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{
    EventKind, EventRecord, GameKind, GameRecord, GameStatus, SettlementRecord, TokenScope,
};

/// How many times the event append retries a sequence collision before
/// reporting it. Collisions are only possible when two processes advance
/// different deadlines of the same game, which the queue conditioning
/// prevents, so one retry is already generous.
const EVENT_SEQ_RETRIES: usize = 3;

#[derive(Clone)]
pub struct GameStore {
    conn: Arc<Mutex<Connection>>,
}

impl GameStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open game db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS games (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                community_id TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                token_address TEXT NOT NULL,
                participants TEXT NOT NULL,
                rotation TEXT NOT NULL,
                eliminated TEXT NOT NULL,
                safe TEXT NOT NULL,
                current_turn TEXT,
                turn_deadline INTEGER,
                turn_seconds INTEGER NOT NULL,
                pot TEXT NOT NULL,
                variant_state TEXT NOT NULL,
                settlement_tx TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_games_status_deadline
             ON games(status, turn_deadline)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                game_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                actor_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (game_id, seq)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                game_id TEXT NOT NULL,
                winner_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                amount TEXT NOT NULL,
                tx_ref TEXT NOT NULL,
                settled_at INTEGER NOT NULL,
                PRIMARY KEY (game_id, winner_id, position)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_game(&self, game: &GameRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO games (id, kind, status, community_id, chain_id, token_address,
                participants, rotation, eliminated, safe, current_turn, turn_deadline,
                turn_seconds, pot, variant_state, settlement_tx, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                &game.id,
                game.kind.as_str(),
                game.status.as_str(),
                &game.community_id,
                game.scope.chain_id,
                &game.scope.token_address,
                serde_json::to_string(&game.participants)?,
                serde_json::to_string(&game.rotation)?,
                serde_json::to_string(&game.eliminated)?,
                serde_json::to_string(&game.safe)?,
                game.current_turn.as_deref(),
                game.turn_deadline,
                game.turn_seconds,
                &game.pot,
                serde_json::to_string(&game.variant_state)?,
                game.settlement_tx.as_deref(),
                game.created_at,
                game.updated_at,
            ],
        )
        .context("insert game")?;
        Ok(())
    }

    pub async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, status, community_id, chain_id, token_address,
                    participants, rotation, eliminated, safe, current_turn, turn_deadline,
                    turn_seconds, pot, variant_state, settlement_tx, created_at, updated_at
             FROM games WHERE id = ?1",
        )?;

        let raw = stmt.query_row(params![game_id], |row| {
            Ok(RawGameRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                status: row.get(2)?,
                community_id: row.get(3)?,
                chain_id: row.get(4)?,
                token_address: row.get(5)?,
                participants: row.get(6)?,
                rotation: row.get(7)?,
                eliminated: row.get(8)?,
                safe: row.get(9)?,
                current_turn: row.get(10)?,
                turn_deadline: row.get(11)?,
                turn_seconds: row.get(12)?,
                pot: row.get(13)?,
                variant_state: row.get(14)?,
                settlement_tx: row.get(15)?,
                created_at: row.get(16)?,
                updated_at: row.get(17)?,
            })
        });

        match raw {
            Ok(raw) => Ok(Some(raw.into_record()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("load game"),
        }
    }

    /// Commit a turn advance, conditioned on the deadline read at the start
    /// of the operation. Returns false when another worker already advanced
    /// this turn (zero rows matched) - the caller must treat that as
    /// success-by-loss, never as an error.
    pub async fn commit_advance(&self, game: &GameRecord, expected_deadline: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE games SET rotation = ?1, eliminated = ?2, current_turn = ?3,
                        turn_deadline = ?4, variant_state = ?5, updated_at = ?6
                 WHERE id = ?7 AND turn_deadline = ?8 AND status = 'in_progress'",
                params![
                    serde_json::to_string(&game.rotation)?,
                    serde_json::to_string(&game.eliminated)?,
                    game.current_turn.as_deref(),
                    game.turn_deadline,
                    serde_json::to_string(&game.variant_state)?,
                    game.updated_at,
                    &game.id,
                    expected_deadline,
                ],
            )
            .context("conditioned turn advance")?;

        if rows == 0 {
            debug!(game_id = %game.id, expected_deadline, "turn already advanced elsewhere");
        }
        Ok(rows == 1)
    }

    /// Flip a non-terminal game to cancelled. Settlement rejects cancelled
    /// games, so this is the one escape hatch for abandoned matches.
    pub async fn cancel_game(&self, game_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE games SET status = 'cancelled', current_turn = NULL,
                    turn_deadline = NULL, updated_at = ?1
             WHERE id = ?2 AND status IN ('open', 'in_progress')",
            params![Utc::now().timestamp(), game_id],
        )?;
        Ok(rows == 1)
    }

    /// Append one event with the next unused sequence number. The sequence is
    /// a scan for the current max, not a counter row; the conditioned queue
    /// write upstream is the true linearization point, so a collision here is
    /// a rarity worth only a bounded retry.
    pub async fn append_event(
        &self,
        game_id: &str,
        actor_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<EventRecord> {
        let conn = self.conn.lock().await;
        let created_at = Utc::now().timestamp();
        let payload_text = serde_json::to_string(&payload)?;

        for _ in 0..EVENT_SEQ_RETRIES {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE game_id = ?1",
                params![game_id],
                |row| row.get(0),
            )?;

            match conn.execute(
                "INSERT INTO events (game_id, seq, actor_id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![game_id, seq, actor_id, kind.as_str(), payload_text, created_at],
            ) {
                Ok(_) => {
                    return Ok(EventRecord {
                        game_id: game_id.to_string(),
                        seq,
                        actor_id: actor_id.to_string(),
                        kind,
                        payload,
                        created_at,
                    })
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    debug!(game_id, seq, "event sequence collision, retrying");
                    continue;
                }
                Err(e) => return Err(e).context("insert event"),
            }
        }

        Err(anyhow!("event sequence contention for game {game_id}"))
    }

    pub async fn list_events(&self, game_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT game_id, seq, actor_id, kind, payload, created_at
             FROM events WHERE game_id = ?1 ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![game_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (game_id, seq, actor_id, kind, payload, created_at) = row?;
            out.push(EventRecord {
                game_id,
                seq,
                actor_id,
                kind: EventKind::from_str(&kind)
                    .ok_or_else(|| anyhow!("unknown event kind {kind}"))?,
                payload: serde_json::from_str(&payload).context("event payload")?,
                created_at,
            });
        }
        Ok(out)
    }

    /// Durably record a settlement: every winner row plus the status flip to
    /// `settled`, in one transaction. The flip is itself conditioned on the
    /// game still being in_progress; losing that race rolls the rows back and
    /// returns false so the caller can fetch the winner's records instead.
    pub async fn record_settlement(
        &self,
        game_id: &str,
        records: &[SettlementRecord],
        primary_tx: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin settlement txn")?;

        for rec in records {
            tx.execute(
                "INSERT INTO settlements (game_id, winner_id, position, amount, tx_ref, settled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &rec.game_id,
                    &rec.winner_id,
                    rec.position,
                    &rec.amount,
                    &rec.tx_ref,
                    rec.settled_at,
                ],
            )
            .context("insert settlement record")?;
        }

        let rows = tx
            .execute(
                "UPDATE games SET status = 'settled', settlement_tx = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'in_progress'",
                params![primary_tx, Utc::now().timestamp(), game_id],
            )
            .context("flip game to settled")?;

        if rows != 1 {
            // Another worker settled first; keep its records, drop ours.
            return Ok(false);
        }

        tx.commit().context("commit settlement txn")?;
        Ok(true)
    }

    pub async fn settlements_for(&self, game_id: &str) -> Result<Vec<SettlementRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT game_id, winner_id, position, amount, tx_ref, settled_at
             FROM settlements WHERE game_id = ?1 ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![game_id], |row| {
            Ok(SettlementRecord {
                game_id: row.get(0)?,
                winner_id: row.get(1)?,
                position: row.get(2)?,
                amount: row.get(3)?,
                tx_ref: row.get(4)?,
                settled_at: row.get(5)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Games whose open turn has passed its deadline.
    pub async fn expired_games(&self, now: i64, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM games
             WHERE status = 'in_progress' AND turn_deadline IS NOT NULL AND turn_deadline <= ?1
             ORDER BY turn_deadline ASC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![now, limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Terminal games that never finished settling (crash between the final
    /// turn and the settlement write). Safe to re-settle: settle() is
    /// idempotent.
    pub async fn games_awaiting_settlement(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM games
             WHERE status = 'in_progress' AND turn_deadline IS NULL
               AND json_extract(variant_state, '$.pending_winners') IS NOT NULL
             ORDER BY updated_at ASC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

struct RawGameRow {
    id: String,
    kind: String,
    status: String,
    community_id: String,
    chain_id: i64,
    token_address: String,
    participants: String,
    rotation: String,
    eliminated: String,
    safe: String,
    current_turn: Option<String>,
    turn_deadline: Option<i64>,
    turn_seconds: i64,
    pot: String,
    variant_state: String,
    settlement_tx: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawGameRow {
    fn into_record(self) -> Result<GameRecord> {
        Ok(GameRecord {
            kind: GameKind::from_str(&self.kind)
                .ok_or_else(|| anyhow!("unknown game kind {}", self.kind))?,
            status: GameStatus::from_str(&self.status)
                .ok_or_else(|| anyhow!("unknown game status {}", self.status))?,
            scope: TokenScope {
                chain_id: self.chain_id,
                token_address: self.token_address,
            },
            participants: serde_json::from_str(&self.participants).context("participants json")?,
            rotation: serde_json::from_str(&self.rotation).context("rotation json")?,
            eliminated: serde_json::from_str(&self.eliminated).context("eliminated json")?,
            safe: serde_json::from_str(&self.safe).context("safe json")?,
            variant_state: serde_json::from_str(&self.variant_state).context("variant state")?,
            id: self.id,
            community_id: self.community_id,
            current_turn: self.current_turn,
            turn_deadline: self.turn_deadline,
            turn_seconds: self.turn_seconds,
            pot: self.pot,
            settlement_tx: self.settlement_tx,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GameKind, PlayerAction};
    use num_bigint::BigUint;

    fn temp_store() -> (tempfile::TempDir, GameStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.db");
        let store = GameStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn started_game(players: &[&str]) -> GameRecord {
        let mut game = GameRecord::open(
            GameKind::Knockout,
            "test-community",
            TokenScope {
                chain_id: 8453,
                token_address: "0xtoken".into(),
            },
            players.iter().map(|p| p.to_string()).collect(),
            &BigUint::from(10_000u32),
            300,
        );
        game.start(1_700_000_000);
        game
    }

    #[tokio::test]
    async fn game_round_trips() {
        let (_dir, store) = temp_store();
        let game = started_game(&["a", "b", "c"]);
        store.insert_game(&game).await.unwrap();

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.rotation, vec!["a", "b", "c"]);
        assert_eq!(loaded.status, GameStatus::InProgress);
        assert_eq!(loaded.current_turn.as_deref(), Some("a"));
        assert_eq!(loaded.turn_deadline, game.turn_deadline);
        assert_eq!(loaded.pot, "10000");

        assert!(store.get_game("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditioned_write_is_at_most_once() {
        let (_dir, store) = temp_store();
        let game = started_game(&["a", "b", "c"]);
        store.insert_game(&game).await.unwrap();
        let expected = game.turn_deadline.unwrap();

        let mut advanced = game.clone();
        advanced.rotation = vec!["b".into(), "c".into(), "a".into()];
        advanced.current_turn = Some("b".into());
        advanced.turn_deadline = Some(expected + 300);

        assert!(store.commit_advance(&advanced, expected).await.unwrap());
        // Second writer read the same deadline: zero rows, no error.
        assert!(!store.commit_advance(&advanced, expected).await.unwrap());

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_turn.as_deref(), Some("b"));
        assert_eq!(loaded.turn_deadline, Some(expected + 300));
    }

    #[tokio::test]
    async fn event_sequences_are_strictly_increasing() {
        let (_dir, store) = temp_store();
        let game = started_game(&["a", "b"]);
        store.insert_game(&game).await.unwrap();

        for i in 0..5 {
            let ev = store
                .append_event(
                    &game.id,
                    "a",
                    EventKind::Passed,
                    serde_json::json!({ "turn": i }),
                )
                .await
                .unwrap();
            assert_eq!(ev.seq, i + 1);
        }

        let events = store.list_events(&game.id).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        // Per-game sequences, not global.
        let other = started_game(&["x", "y"]);
        store.insert_game(&other).await.unwrap();
        let ev = store
            .append_event(&other.id, "x", EventKind::Passed, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(ev.seq, 1);
    }

    #[tokio::test]
    async fn settlement_writes_records_and_flips_status_once() {
        let (_dir, store) = temp_store();
        let game = started_game(&["a", "b"]);
        store.insert_game(&game).await.unwrap();

        let records = vec![SettlementRecord {
            game_id: game.id.clone(),
            winner_id: "a".into(),
            position: 1,
            amount: "10000".into(),
            tx_ref: "0xabc".into(),
            settled_at: 1_700_000_500,
        }];

        assert!(store
            .record_settlement(&game.id, &records, "0xabc")
            .await
            .unwrap());

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GameStatus::Settled);
        assert_eq!(loaded.settlement_tx.as_deref(), Some("0xabc"));
        assert_eq!(store.settlements_for(&game.id).await.unwrap(), records);

        // A raced duplicate must roll back its rows and report the loss.
        let dupe = vec![SettlementRecord {
            tx_ref: "0xother".into(),
            position: 2,
            ..records[0].clone()
        }];
        assert!(!store
            .record_settlement(&game.id, &dupe, "0xother")
            .await
            .unwrap());
        assert_eq!(store.settlements_for(&game.id).await.unwrap(), records);
    }

    #[tokio::test]
    async fn expired_and_awaiting_scans() {
        let (_dir, store) = temp_store();

        let live = started_game(&["a", "b"]);
        store.insert_game(&live).await.unwrap();

        let mut terminal = started_game(&["c", "d"]);
        terminal.current_turn = None;
        terminal.turn_deadline = None;
        terminal.variant_state = serde_json::json!({
            "pending_winners": [
                { "participant_id": "c", "amount": "10000", "position": 1 }
            ]
        });
        store.insert_game(&terminal).await.unwrap();

        let expired = store
            .expired_games(live.turn_deadline.unwrap() + 1, 10)
            .await
            .unwrap();
        assert_eq!(expired, vec![live.id.clone()]);

        let before = store
            .expired_games(live.turn_deadline.unwrap() - 1, 10)
            .await
            .unwrap();
        assert!(before.is_empty());

        let awaiting = store.games_awaiting_settlement(10).await.unwrap();
        assert_eq!(awaiting, vec![terminal.id.clone()]);
    }

    #[tokio::test]
    async fn cancel_only_hits_non_terminal_games() {
        let (_dir, store) = temp_store();
        let game = started_game(&["a", "b"]);
        store.insert_game(&game).await.unwrap();

        assert!(store.cancel_game(&game.id).await.unwrap());
        assert!(!store.cancel_game(&game.id).await.unwrap());

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GameStatus::Cancelled);
        assert!(loaded.turn_deadline.is_none());
    }

    #[test]
    fn action_serde_shape() {
        let action = PlayerAction::Eliminate { target: "b".into() };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "eliminate");
        assert_eq!(json["target"], "b");
    }
}
