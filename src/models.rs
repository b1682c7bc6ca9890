//! Core game records and shared types
//!
//! One place for the rows the engine reads and writes. Prize amounts are
//! ERC-20 base units carried as decimal strings in records and JSON, and
//! parsed to `BigUint` only where arithmetic happens.

use chrono::Utc;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Game lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Open,
    InProgress,
    Settled,
    Cancelled,
}

impl GameStatus {
    pub fn as_str(&self) -> &str {
        match self {
            GameStatus::Open => "open",
            GameStatus::InProgress => "in_progress",
            GameStatus::Settled => "settled",
            GameStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(GameStatus::Open),
            "in_progress" => Some(GameStatus::InProgress),
            "settled" => Some(GameStatus::Settled),
            "cancelled" => Some(GameStatus::Cancelled),
            _ => None,
        }
    }
}

/// Game variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    /// Turn-queue elimination: the head knocks another player out each turn.
    Knockout,
    /// Pick-a-pile: each player banks one concealed pile per lap.
    Piles,
    /// Two-party negotiation over the pot.
    Split,
    /// Round-based voting: each lap votes one player out.
    Tribunal,
}

impl GameKind {
    pub fn as_str(&self) -> &str {
        match self {
            GameKind::Knockout => "knockout",
            GameKind::Piles => "piles",
            GameKind::Split => "split",
            GameKind::Tribunal => "tribunal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "knockout" => Some(GameKind::Knockout),
            "piles" => Some(GameKind::Piles),
            "split" => Some(GameKind::Split),
            "tribunal" => Some(GameKind::Tribunal),
            _ => None,
        }
    }
}

/// A player-submitted (or sweep-synthesized) turn action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerAction {
    Eliminate { target: String },
    Pass,
    Pick { pile: usize },
    Offer { split_bps: u32 },
    Accept,
    Vote { target: String },
    Forfeit,
}

impl PlayerAction {
    /// The other participant this action points at, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            PlayerAction::Eliminate { target } | PlayerAction::Vote { target } => Some(target),
            _ => None,
        }
    }
}

/// Event kinds recorded in the append-only log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Eliminated,
    Passed,
    Picked,
    Offered,
    Accepted,
    Voted,
    Forfeited,
    TimeoutPass,
    TimeoutForfeit,
    Settled,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Eliminated => "eliminated",
            EventKind::Passed => "passed",
            EventKind::Picked => "picked",
            EventKind::Offered => "offered",
            EventKind::Accepted => "accepted",
            EventKind::Voted => "voted",
            EventKind::Forfeited => "forfeited",
            EventKind::TimeoutPass => "timeout_pass",
            EventKind::TimeoutForfeit => "timeout_forfeit",
            EventKind::Settled => "settled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "eliminated" => Some(EventKind::Eliminated),
            "passed" => Some(EventKind::Passed),
            "picked" => Some(EventKind::Picked),
            "offered" => Some(EventKind::Offered),
            "accepted" => Some(EventKind::Accepted),
            "voted" => Some(EventKind::Voted),
            "forfeited" => Some(EventKind::Forfeited),
            "timeout_pass" => Some(EventKind::TimeoutPass),
            "timeout_forfeit" => Some(EventKind::TimeoutForfeit),
            "settled" => Some(EventKind::Settled),
            _ => None,
        }
    }

    /// Timeout-flavored kind for the same action when the sweep fires it.
    pub fn as_timeout(self) -> Self {
        match self {
            EventKind::Passed => EventKind::TimeoutPass,
            EventKind::Forfeited => EventKind::TimeoutForfeit,
            other => other,
        }
    }
}

/// Token scope a game pays out in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenScope {
    pub chain_id: i64,
    pub token_address: String,
}

/// Context handed to the address-resolution collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingContext {
    pub community_id: String,
    pub scope: TokenScope,
}

/// One winner's share of the pot, in base units (decimal string)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerShare {
    pub participant_id: String,
    pub amount: String,
    pub position: u32,
}

impl WinnerShare {
    pub fn new(participant_id: impl Into<String>, amount: &BigUint, position: u32) -> Self {
        Self {
            participant_id: participant_id.into(),
            amount: amount.to_string(),
            position,
        }
    }

    pub fn amount_units(&self) -> Option<BigUint> {
        self.amount.parse::<BigUint>().ok()
    }
}

/// One game row (the single mutable resource per match)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub kind: GameKind,
    pub status: GameStatus,
    pub community_id: String,
    pub scope: TokenScope,
    /// Original signup roster; never shrinks.
    pub participants: Vec<String>,
    /// Current turn order. Always equals the remaining (active) set.
    pub rotation: Vec<String>,
    pub eliminated: Vec<String>,
    /// Ids immune to elimination.
    pub safe: Vec<String>,
    /// Head of rotation, if a turn is open.
    pub current_turn: Option<String>,
    /// Unix seconds; the compare-and-swap field for turn advances.
    pub turn_deadline: Option<i64>,
    pub turn_seconds: i64,
    /// Pot in base units, decimal string.
    pub pot: String,
    /// Variant-owned state blob (piles, claims, offers, votes, pending winners).
    pub variant_state: serde_json::Value,
    pub settlement_tx: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GameRecord {
    /// New game in signup, roster and pot fixed by the (out-of-scope) creation flow.
    pub fn open(
        kind: GameKind,
        community_id: impl Into<String>,
        scope: TokenScope,
        participants: Vec<String>,
        pot: &BigUint,
        turn_seconds: i64,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: GameStatus::Open,
            community_id: community_id.into(),
            scope,
            participants,
            rotation: Vec::new(),
            eliminated: Vec::new(),
            safe: Vec::new(),
            current_turn: None,
            turn_deadline: None,
            turn_seconds,
            pot: pot.to_string(),
            variant_state: serde_json::json!({}),
            settlement_tx: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move signup -> in_progress: rotation seeded from the roster, first turn opened.
    pub fn start(&mut self, now: i64) {
        self.status = GameStatus::InProgress;
        self.rotation = self.participants.clone();
        self.current_turn = self.rotation.first().cloned();
        self.turn_deadline = Some(now + self.turn_seconds);
        self.updated_at = now;
    }

    pub fn pot_units(&self) -> Option<BigUint> {
        self.pot.parse::<BigUint>().ok()
    }

    pub fn is_participant(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p == id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.rotation.iter().any(|p| p == id)
    }

    pub fn is_safe(&self, id: &str) -> bool {
        self.safe.iter().any(|p| p == id)
    }

    /// Final standings recorded by the terminating turn advance, awaiting
    /// settlement.
    pub fn pending_winners(&self) -> Option<Vec<WinnerShare>> {
        self.variant_state
            .get("pending_winners")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn staking_context(&self) -> StakingContext {
        StakingContext {
            community_id: self.community_id.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// One append-only event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub game_id: String,
    pub seq: i64,
    pub actor_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// One write-once settlement row per (game, winner, position)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub game_id: String,
    pub winner_id: String,
    pub position: i64,
    pub amount: String,
    pub tx_ref: String,
    pub settled_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            GameStatus::Open,
            GameStatus::InProgress,
            GameStatus::Settled,
            GameStatus::Cancelled,
        ] {
            assert_eq!(GameStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(GameStatus::from_str("paused"), None);
    }

    #[test]
    fn start_opens_first_turn() {
        let mut game = GameRecord::open(
            GameKind::Knockout,
            "beta-cartel",
            TokenScope {
                chain_id: 8453,
                token_address: "0xdead".into(),
            },
            vec!["a".into(), "b".into(), "c".into()],
            &BigUint::from(1_000u32),
            300,
        );
        game.start(1_700_000_000);

        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.current_turn.as_deref(), Some("a"));
        assert_eq!(game.turn_deadline, Some(1_700_000_300));
        assert_eq!(game.rotation.len(), 3);
    }

    #[test]
    fn timeout_kind_mapping() {
        assert_eq!(EventKind::Passed.as_timeout(), EventKind::TimeoutPass);
        assert_eq!(EventKind::Forfeited.as_timeout(), EventKind::TimeoutForfeit);
        assert_eq!(EventKind::Eliminated.as_timeout(), EventKind::Eliminated);
    }
}
