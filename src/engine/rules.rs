//! Game variant rules
//!
//! One strategy object per game kind. A variant owns the rotation math, its
//! private state blob (`variant_state` on the game row), the action it
//! synthesizes on timeout, and the termination predicate. Validation that is
//! common to every variant (actor is head, target is active, no
//! self-targeting, safe set) lives in the turn engine, not here.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::EngineError;
use crate::models::{EventKind, GameKind, GameRecord, PlayerAction, WinnerShare};

/// The computed result of one accepted action.
#[derive(Debug, Clone)]
pub struct Advance {
    /// Next turn order, head first. Empty forces terminal standings.
    pub rotation: Vec<String>,
    pub newly_eliminated: Vec<String>,
    pub variant_state: serde_json::Value,
    pub event_kind: EventKind,
    pub event_payload: serde_json::Value,
    /// Some = the termination predicate fired; ordered final standings.
    pub winners: Option<Vec<WinnerShare>>,
}

pub trait GameRules: Send + Sync {
    fn kind(&self) -> GameKind;

    fn min_players(&self) -> usize;

    /// Action synthesized by the sweep when the head's turn expires.
    fn timeout_action(&self) -> PlayerAction;

    /// Compute the next rotation and state for a validated actor + action.
    fn apply(
        &self,
        game: &GameRecord,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<Advance, EngineError>;

    /// Fallback standings when the computed queue empties without a natural
    /// terminal. Games are never left headless.
    fn standings(&self, game: &GameRecord) -> Vec<WinnerShare>;
}

pub fn rules_for(kind: GameKind) -> &'static dyn GameRules {
    match kind {
        GameKind::Knockout => &Knockout,
        GameKind::Piles => &Piles,
        GameKind::Split => &Split,
        GameKind::Tribunal => &Tribunal,
    }
}

/// Pot split with the integer remainder going to position 1.
fn even_split(pot: &BigUint, ids: &[String]) -> Vec<WinnerShare> {
    if ids.is_empty() {
        return Vec::new();
    }
    let n = BigUint::from(ids.len());
    let share = pot / &n;
    let remainder = pot - (&share * &n);

    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let mut amount = share.clone();
            if i == 0 {
                amount += &remainder;
            }
            WinnerShare::new(id.clone(), &amount, (i + 1) as u32)
        })
        .collect()
}

fn units(s: &str) -> BigUint {
    s.parse().unwrap_or_default()
}

/// Head rotates to the back of the queue.
fn rotate(rotation: &[String]) -> Vec<String> {
    match rotation.split_first() {
        Some((head, rest)) => {
            let mut next = rest.to_vec();
            next.push(head.clone());
            next
        }
        None => Vec::new(),
    }
}

/// Drop `id` from the rotation without disturbing the order of the rest.
fn without(rotation: &[String], id: &str) -> Vec<String> {
    rotation.iter().filter(|p| *p != id).cloned().collect()
}

// ---------------------------------------------------------------------------
// Knockout
// ---------------------------------------------------------------------------

/// Turn-queue elimination. The head eliminates one target per turn (or
/// passes); an expired turn forfeits the idle head. Last player standing
/// takes the pot.
pub struct Knockout;

impl GameRules for Knockout {
    fn kind(&self) -> GameKind {
        GameKind::Knockout
    }

    fn min_players(&self) -> usize {
        2
    }

    fn timeout_action(&self) -> PlayerAction {
        PlayerAction::Forfeit
    }

    fn apply(
        &self,
        game: &GameRecord,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<Advance, EngineError> {
        let pot = game.pot_units().unwrap_or_default();

        let (rotation, newly_eliminated, event_kind, event_payload) = match action {
            PlayerAction::Eliminate { target } => {
                let next = rotate(&without(&game.rotation, target));
                (
                    next,
                    vec![target.clone()],
                    EventKind::Eliminated,
                    serde_json::json!({ "target": target }),
                )
            }
            PlayerAction::Pass => (
                rotate(&game.rotation),
                Vec::new(),
                EventKind::Passed,
                serde_json::json!({}),
            ),
            PlayerAction::Forfeit => (
                without(&game.rotation, actor),
                vec![actor.to_string()],
                EventKind::Forfeited,
                serde_json::json!({}),
            ),
            other => {
                return Err(EngineError::InvalidAction(format!(
                    "knockout does not accept {other:?}"
                )))
            }
        };

        let winners = if rotation.len() <= 1 {
            Some(
                rotation
                    .first()
                    .map(|survivor| vec![WinnerShare::new(survivor.clone(), &pot, 1)])
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        Ok(Advance {
            rotation,
            newly_eliminated,
            variant_state: game.variant_state.clone(),
            event_kind,
            event_payload,
            winners,
        })
    }

    fn standings(&self, game: &GameRecord) -> Vec<WinnerShare> {
        let pot = game.pot_units().unwrap_or_default();
        if !game.rotation.is_empty() {
            return even_split(&pot, &game.rotation);
        }
        // Everyone is out; the most recently eliminated outlasted the rest.
        game.eliminated
            .last()
            .map(|last| vec![WinnerShare::new(last.clone(), &pot, 1)])
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Piles
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct PilesState {
    /// Concealed amounts still on the table, base units as decimal strings.
    #[serde(default)]
    piles: Vec<String>,
    /// Banked amount per player.
    #[serde(default)]
    claims: BTreeMap<String, String>,
    /// Total picks taken this game; one lap = one pick per player.
    #[serde(default)]
    picks: usize,
}

/// Pick-a-pile: each active player banks one concealed pile per lap. A timed
/// out turn consumes the pick with nothing banked. One full lap (or pile
/// exhaustion) ends the game; players are paid what they banked.
pub struct Piles;

impl Piles {
    /// Variant state for game creation: the concealed piles.
    pub fn seed_state(piles: &[BigUint]) -> serde_json::Value {
        serde_json::json!({
            "piles": piles.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "claims": {},
            "picks": 0,
        })
    }

    fn ranked_claims(state: &PilesState, game: &GameRecord) -> Vec<WinnerShare> {
        let mut ranked: Vec<(String, BigUint)> = state
            .claims
            .iter()
            .map(|(id, amount)| (id.clone(), units(amount)))
            .filter(|(_, amount)| *amount > BigUint::default())
            .collect();
        // Largest bank first; BTreeMap iteration makes ties stable by id.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        if ranked.is_empty() {
            // Nobody banked a pile: the pot splits evenly instead of vanishing.
            let pot = game.pot_units().unwrap_or_default();
            return even_split(&pot, &game.rotation);
        }

        ranked
            .into_iter()
            .enumerate()
            .map(|(i, (id, amount))| WinnerShare::new(id, &amount, (i + 1) as u32))
            .collect()
    }
}

impl GameRules for Piles {
    fn kind(&self) -> GameKind {
        GameKind::Piles
    }

    fn min_players(&self) -> usize {
        2
    }

    fn timeout_action(&self) -> PlayerAction {
        PlayerAction::Pass
    }

    fn apply(
        &self,
        game: &GameRecord,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<Advance, EngineError> {
        let mut state: PilesState = serde_json::from_value(game.variant_state.clone())
            .map_err(|e| EngineError::InvalidAction(format!("piles state unreadable: {e}")))?;

        let (event_kind, event_payload) = match action {
            PlayerAction::Pick { pile } => {
                if *pile >= state.piles.len() {
                    return Err(EngineError::InvalidAction(format!(
                        "pile {pile} is not on the table"
                    )));
                }
                let amount = state.piles.remove(*pile);
                let banked = units(state.claims.get(actor).map(String::as_str).unwrap_or("0"))
                    + units(&amount);
                state.claims.insert(actor.to_string(), banked.to_string());
                (
                    EventKind::Picked,
                    serde_json::json!({ "pile": pile, "amount": amount }),
                )
            }
            PlayerAction::Pass => (EventKind::Passed, serde_json::json!({})),
            other => {
                return Err(EngineError::InvalidAction(format!(
                    "piles does not accept {other:?}"
                )))
            }
        };

        state.picks += 1;
        let lap_done = state.picks >= game.rotation.len();
        let table_empty = state.piles.is_empty();

        let winners = if lap_done || table_empty {
            Some(Self::ranked_claims(&state, game))
        } else {
            None
        };

        Ok(Advance {
            rotation: rotate(&game.rotation),
            newly_eliminated: Vec::new(),
            variant_state: serde_json::to_value(&state)
                .map_err(|e| EngineError::Storage(e.into()))?,
            event_kind,
            event_payload,
            winners,
        })
    }

    fn standings(&self, game: &GameRecord) -> Vec<WinnerShare> {
        let state: PilesState =
            serde_json::from_value(game.variant_state.clone()).unwrap_or_default();
        Self::ranked_claims(&state, game)
    }
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

fn default_max_rounds() -> u32 {
    6
}

#[derive(Debug, Serialize, Deserialize)]
struct SplitState {
    /// Standing offer: counterparty's share of the pot, in bps.
    #[serde(default)]
    offer_bps: Option<u32>,
    #[serde(default)]
    offer_from: Option<String>,
    /// Offers and passes exchanged so far.
    #[serde(default)]
    rounds: u32,
    #[serde(default = "default_max_rounds")]
    max_rounds: u32,
}

impl Default for SplitState {
    fn default() -> Self {
        Self {
            offer_bps: None,
            offer_from: None,
            rounds: 0,
            max_rounds: default_max_rounds(),
        }
    }
}

/// Two-party negotiation. Offers propose the counterparty's share in bps; a
/// fresh offer is the counter. Accepting settles at the standing offer. The
/// round cap closes a deadlock at an even split; a timed out party forfeits
/// the pot.
pub struct Split;

impl Split {
    fn split_by_bps(
        pot: &BigUint,
        acceptor: &str,
        offerer: &str,
        bps: u32,
    ) -> Vec<WinnerShare> {
        let acceptor_amount = (pot * bps) / 10_000u32;
        let offerer_amount = pot - &acceptor_amount;

        let mut winners = if acceptor_amount > offerer_amount {
            vec![
                WinnerShare::new(acceptor.to_string(), &acceptor_amount, 1),
                WinnerShare::new(offerer.to_string(), &offerer_amount, 2),
            ]
        } else {
            vec![
                WinnerShare::new(offerer.to_string(), &offerer_amount, 1),
                WinnerShare::new(acceptor.to_string(), &acceptor_amount, 2),
            ]
        };
        winners.retain(|w| w.amount != "0");
        winners
    }
}

impl GameRules for Split {
    fn kind(&self) -> GameKind {
        GameKind::Split
    }

    fn min_players(&self) -> usize {
        2
    }

    fn timeout_action(&self) -> PlayerAction {
        PlayerAction::Forfeit
    }

    fn apply(
        &self,
        game: &GameRecord,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<Advance, EngineError> {
        if game.rotation.len() != 2 {
            return Err(EngineError::InvalidAction(
                "split requires exactly two parties".into(),
            ));
        }
        let pot = game.pot_units().unwrap_or_default();
        let counterparty = game
            .rotation
            .iter()
            .find(|p| *p != actor)
            .cloned()
            .unwrap_or_default();

        let mut state: SplitState = serde_json::from_value(game.variant_state.clone())
            .map_err(|e| EngineError::InvalidAction(format!("split state unreadable: {e}")))?;

        match action {
            PlayerAction::Offer { split_bps } => {
                if *split_bps > 10_000 {
                    return Err(EngineError::InvalidAction(format!(
                        "offer of {split_bps} bps exceeds the pot"
                    )));
                }
                state.rounds += 1;
                if state.rounds > state.max_rounds {
                    // Deadlocked negotiation closes at an even split.
                    return Ok(Advance {
                        rotation: game.rotation.clone(),
                        newly_eliminated: Vec::new(),
                        variant_state: serde_json::to_value(&state)
                            .map_err(|e| EngineError::Storage(e.into()))?,
                        event_kind: EventKind::Offered,
                        event_payload: serde_json::json!({
                            "split_bps": split_bps,
                            "deadlocked": true,
                        }),
                        winners: Some(even_split(&pot, &game.rotation)),
                    });
                }
                state.offer_bps = Some(*split_bps);
                state.offer_from = Some(actor.to_string());
                Ok(Advance {
                    rotation: rotate(&game.rotation),
                    newly_eliminated: Vec::new(),
                    variant_state: serde_json::to_value(&state)
                        .map_err(|e| EngineError::Storage(e.into()))?,
                    event_kind: EventKind::Offered,
                    event_payload: serde_json::json!({ "split_bps": split_bps }),
                    winners: None,
                })
            }
            PlayerAction::Accept => {
                let (Some(bps), Some(offerer)) = (state.offer_bps, state.offer_from.clone())
                else {
                    return Err(EngineError::InvalidAction("no offer on the table".into()));
                };
                if offerer == actor {
                    return Err(EngineError::InvalidAction(
                        "cannot accept your own offer".into(),
                    ));
                }
                Ok(Advance {
                    rotation: game.rotation.clone(),
                    newly_eliminated: Vec::new(),
                    variant_state: serde_json::to_value(&state)
                        .map_err(|e| EngineError::Storage(e.into()))?,
                    event_kind: EventKind::Accepted,
                    event_payload: serde_json::json!({ "split_bps": bps }),
                    winners: Some(Self::split_by_bps(&pot, actor, &offerer, bps)),
                })
            }
            PlayerAction::Pass => {
                state.rounds += 1;
                let winners = if state.rounds > state.max_rounds {
                    Some(even_split(&pot, &game.rotation))
                } else {
                    None
                };
                Ok(Advance {
                    rotation: rotate(&game.rotation),
                    newly_eliminated: Vec::new(),
                    variant_state: serde_json::to_value(&state)
                        .map_err(|e| EngineError::Storage(e.into()))?,
                    event_kind: EventKind::Passed,
                    event_payload: serde_json::json!({}),
                    winners,
                })
            }
            PlayerAction::Forfeit => Ok(Advance {
                rotation: vec![counterparty.clone()],
                newly_eliminated: vec![actor.to_string()],
                variant_state: game.variant_state.clone(),
                event_kind: EventKind::Forfeited,
                event_payload: serde_json::json!({}),
                winners: Some(vec![WinnerShare::new(counterparty, &pot, 1)]),
            }),
            other => Err(EngineError::InvalidAction(format!(
                "split does not accept {other:?}"
            ))),
        }
    }

    fn standings(&self, game: &GameRecord) -> Vec<WinnerShare> {
        let pot = game.pot_units().unwrap_or_default();
        even_split(&pot, &game.rotation)
    }
}

// ---------------------------------------------------------------------------
// Tribunal
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct TribunalState {
    /// This round's ballots; None is an abstention.
    #[serde(default)]
    votes: BTreeMap<String, Option<String>>,
    #[serde(default)]
    round: u32,
}

/// Round-based voting. Every active player casts one ballot per lap; when the
/// lap closes, the plurality target is eliminated (ties eliminate nobody) and
/// the ballots reset. Two survivors split the pot.
pub struct Tribunal;

impl Tribunal {
    fn tally(votes: &BTreeMap<String, Option<String>>) -> Option<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for target in votes.values().flatten() {
            *counts.entry(target.as_str()).or_insert(0) += 1;
        }
        let best = counts.values().copied().max()?;
        let mut leaders = counts.iter().filter(|(_, c)| **c == best);
        let leader = leaders.next()?.0.to_string();
        if leaders.next().is_some() {
            return None; // tied round, nobody leaves
        }
        Some(leader)
    }
}

impl GameRules for Tribunal {
    fn kind(&self) -> GameKind {
        GameKind::Tribunal
    }

    fn min_players(&self) -> usize {
        3
    }

    fn timeout_action(&self) -> PlayerAction {
        PlayerAction::Pass
    }

    fn apply(
        &self,
        game: &GameRecord,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<Advance, EngineError> {
        let mut state: TribunalState = serde_json::from_value(game.variant_state.clone())
            .map_err(|e| EngineError::InvalidAction(format!("tribunal state unreadable: {e}")))?;

        let (event_kind, mut event_payload) = match action {
            PlayerAction::Vote { target } => {
                state.votes.insert(actor.to_string(), Some(target.clone()));
                (EventKind::Voted, serde_json::json!({ "target": target }))
            }
            PlayerAction::Pass => {
                state.votes.insert(actor.to_string(), None);
                (EventKind::Passed, serde_json::json!({}))
            }
            other => {
                return Err(EngineError::InvalidAction(format!(
                    "tribunal does not accept {other:?}"
                )))
            }
        };

        let mut rotation = rotate(&game.rotation);
        let mut newly_eliminated = Vec::new();

        if state.votes.len() >= game.rotation.len() {
            // Lap closed: count the ballots.
            let voted_out = Self::tally(&state.votes);
            if let Some(out) = &voted_out {
                rotation = without(&rotation, out);
                newly_eliminated.push(out.clone());
            }
            state.votes.clear();
            state.round += 1;
            event_payload["round_closed"] = serde_json::json!(state.round);
            event_payload["voted_out"] = serde_json::json!(voted_out);
        }

        let winners = if rotation.len() <= 2 {
            let pot = game.pot_units().unwrap_or_default();
            Some(even_split(&pot, &rotation))
        } else {
            None
        };

        Ok(Advance {
            rotation,
            newly_eliminated,
            variant_state: serde_json::to_value(&state)
                .map_err(|e| EngineError::Storage(e.into()))?,
            event_kind,
            event_payload,
            winners,
        })
    }

    fn standings(&self, game: &GameRecord) -> Vec<WinnerShare> {
        let pot = game.pot_units().unwrap_or_default();
        even_split(&pot, &game.rotation)
    }
}
