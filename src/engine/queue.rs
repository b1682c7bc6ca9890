//! Turn queue engine
//!
//! Owns whose turn it is and advances it safely under concurrent triggers.
//! A player action and a scheduler sweep racing for the same deadline both
//! funnel into the same conditioned store write, so exactly one of them can
//! win; the loser sees `AdvanceOutcome::AlreadyAdvanced` and exits quietly.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::EngineError;
use super::rules::rules_for;
use super::settlement::Notifier;
use super::store::GameStore;
use crate::models::{GameRecord, GameStatus, PlayerAction, WinnerShare};

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Ops tooling may act for the current head.
    pub admin_override: bool,
}

/// Explicit no-op results instead of errors: losing the deadline race and
/// sweeping a turn that is not due are both expected outcomes at call sites.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    Advanced {
        next_turn: Option<String>,
        /// Some = the termination predicate fired; settle these standings.
        winners: Option<Vec<WinnerShare>>,
    },
    /// Another trigger already advanced this deadline (zero rows written).
    AlreadyAdvanced,
    /// Nothing for the sweep to do: no open turn, or the deadline is ahead.
    NotExpired,
}

impl AdvanceOutcome {
    pub fn winners(&self) -> Option<&[WinnerShare]> {
        match self {
            AdvanceOutcome::Advanced {
                winners: Some(w), ..
            } => Some(w),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct TurnEngine {
    store: GameStore,
    notifier: Arc<dyn Notifier>,
}

impl TurnEngine {
    pub fn new(store: GameStore, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// A player (or an operator overriding for the head) takes the current
    /// turn.
    pub async fn submit_action(
        &self,
        game_id: &str,
        actor_id: &str,
        action: PlayerAction,
        opts: SubmitOptions,
    ) -> Result<AdvanceOutcome, EngineError> {
        let game = self.load_in_progress(game_id).await?;
        let deadline = game
            .turn_deadline
            .ok_or_else(|| EngineError::NoTurnOpen(game_id.to_string()))?;
        let head = game
            .current_turn
            .clone()
            .ok_or_else(|| EngineError::NoTurnOpen(game_id.to_string()))?;

        if actor_id != head && !opts.admin_override {
            return Err(EngineError::NotYourTurn {
                actor: actor_id.to_string(),
            });
        }

        if let Some(target) = action.target() {
            if target == actor_id {
                return Err(EngineError::SelfTarget);
            }
            if !game.is_active(target) {
                return Err(EngineError::UnknownTarget {
                    target: target.to_string(),
                });
            }
            if game.is_safe(target) {
                return Err(EngineError::TargetSafe {
                    target: target.to_string(),
                });
            }
        }

        self.advance(game, actor_id, action, deadline, false).await
    }

    /// Scheduler path: synthesize the variant's timeout action for an
    /// overdue turn. Identical conditioned-write mechanics as a player
    /// action, so a late player and the sweep can only advance once between
    /// them.
    pub async fn sweep_expired(&self, game_id: &str) -> Result<AdvanceOutcome, EngineError> {
        let game = self
            .store
            .get_game(game_id)
            .await?
            .ok_or_else(|| EngineError::GameNotFound(game_id.to_string()))?;

        if game.status != GameStatus::InProgress {
            return Ok(AdvanceOutcome::NotExpired);
        }
        let game = normalized(game);
        let (Some(deadline), Some(head)) = (game.turn_deadline, game.current_turn.clone()) else {
            return Ok(AdvanceOutcome::NotExpired);
        };
        if deadline > Utc::now().timestamp() {
            return Ok(AdvanceOutcome::NotExpired);
        }

        let action = rules_for(game.kind).timeout_action();
        debug!(game_id, head = %head, "sweeping expired turn");
        self.advance(game, &head, action, deadline, true).await
    }

    async fn load_in_progress(&self, game_id: &str) -> Result<GameRecord, EngineError> {
        let game = self
            .store
            .get_game(game_id)
            .await?
            .ok_or_else(|| EngineError::GameNotFound(game_id.to_string()))?;
        if game.status != GameStatus::InProgress {
            return Err(EngineError::WrongStatus {
                game_id: game_id.to_string(),
                status: game.status.as_str().to_string(),
            });
        }
        Ok(normalized(game))
    }

    async fn advance(
        &self,
        game: GameRecord,
        actor_id: &str,
        action: PlayerAction,
        expected_deadline: i64,
        is_timeout: bool,
    ) -> Result<AdvanceOutcome, EngineError> {
        let rules = rules_for(game.kind);
        let adv = rules.apply(&game, actor_id, &action)?;
        let now = Utc::now().timestamp();

        let mut updated = game.clone();
        updated.rotation = adv.rotation;
        for id in &adv.newly_eliminated {
            if !updated.eliminated.contains(id) {
                updated.eliminated.push(id.clone());
            }
        }
        updated.variant_state = adv.variant_state;
        updated.updated_at = now;

        let mut winners = adv.winners;
        if winners.is_none() && updated.rotation.is_empty() {
            // An empty queue never stays headless.
            winners = Some(rules.standings(&updated));
        }

        match &winners {
            Some(w) => {
                updated.current_turn = None;
                updated.turn_deadline = None;
                set_pending_winners(&mut updated, w)?;
            }
            None => {
                updated.current_turn = updated.rotation.first().cloned();
                updated.turn_deadline = Some(now + updated.turn_seconds);
            }
        }

        if !self.store.commit_advance(&updated, expected_deadline).await? {
            return Ok(AdvanceOutcome::AlreadyAdvanced);
        }

        let event_kind = if is_timeout {
            adv.event_kind.as_timeout()
        } else {
            adv.event_kind
        };
        // The queue write above is the linearization point; a failed append
        // is a gap in the audit trail, not a reason to unwind the turn.
        if let Err(e) = self
            .store
            .append_event(&game.id, actor_id, event_kind, adv.event_payload)
            .await
        {
            warn!(game_id = %game.id, error = %e, "event append failed after committed advance");
        }

        info!(
            game_id = %game.id,
            actor = actor_id,
            kind = event_kind.as_str(),
            next_turn = updated.current_turn.as_deref().unwrap_or("-"),
            terminal = winners.is_some(),
            "turn advanced"
        );

        if let Some(next) = &updated.current_turn {
            if let Err(e) = self
                .notifier
                .notify(next, &format!("your move in game {}", game.id))
                .await
            {
                warn!(game_id = %game.id, participant = %next, error = %e, "turn notification failed");
            }
        }

        Ok(AdvanceOutcome::Advanced {
            next_turn: updated.current_turn,
            winners,
        })
    }
}

/// The rotation is filtered against the eliminated set before any index
/// math, so an elimination can never leave a stale id at the head.
fn normalized(mut game: GameRecord) -> GameRecord {
    let eliminated = game.eliminated.clone();
    game.rotation.retain(|p| !eliminated.contains(p));
    if game.current_turn.is_some() {
        game.current_turn = game.rotation.first().cloned();
    }
    game
}

fn set_pending_winners(game: &mut GameRecord, winners: &[WinnerShare]) -> Result<(), EngineError> {
    let value = serde_json::to_value(winners).map_err(|e| EngineError::Storage(e.into()))?;
    match game.variant_state.as_object_mut() {
        Some(map) => {
            map.insert("pending_winners".to_string(), value);
        }
        None => {
            game.variant_state = serde_json::json!({ "pending_winners": value });
        }
    }
    Ok(())
}
