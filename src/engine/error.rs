//! Engine error taxonomy
//!
//! Validation failures are surfaced verbatim and never mutate state.
//! Contention losses are NOT errors (see `AdvanceOutcome::AlreadyAdvanced`).
//! `SettleError::TxCountMismatch` is the one critical, non-retryable class:
//! it means the transfer collaborator returned evidence for a different
//! number of payouts than we asked for.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("game {0} not found")]
    GameNotFound(String),

    #[error("game {game_id} is {status}, expected in_progress")]
    WrongStatus { game_id: String, status: String },

    #[error("actor {actor} is not the current turn holder")]
    NotYourTurn { actor: String },

    #[error("no turn is open for game {0}")]
    NoTurnOpen(String),

    #[error("target {target} is not in the active rotation")]
    UnknownTarget { target: String },

    #[error("self-targeting is not allowed")]
    SelfTarget,

    #[error("target {target} is safe this round")]
    TargetSafe { target: String },

    #[error("action not valid for this game: {0}")]
    InvalidAction(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("game {0} not found")]
    GameNotFound(String),

    #[error("game {0} is cancelled, nothing to settle")]
    Cancelled(String),

    #[error("game {game_id} is {status}, expected a terminal in_progress game")]
    WrongStatus { game_id: String, status: String },

    #[error("empty winners list")]
    NoWinners,

    #[error("winner {0} never signed up for this game")]
    UnknownWinner(String),

    #[error("winner {0} listed twice")]
    DuplicateWinner(String),

    #[error("bad amount for winner {0}")]
    BadAmount(String),

    #[error("winner amounts exceed the pot")]
    OverPay,

    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error("no payout address for winner {0}")]
    MissingAddress(String),

    #[error("token transfer failed: {0}")]
    Transfer(String),

    #[error("transfer returned {got} references for {expected} payouts")]
    TxCountMismatch { expected: usize, got: usize },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SettleError {
    /// Whether a caller may safely re-run `settle` with the same inputs.
    /// The count mismatch is a data-corruption guard and must be escalated,
    /// not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettleError::AddressResolution(_)
                | SettleError::MissingAddress(_)
                | SettleError::Transfer(_)
                | SettleError::Storage(_)
        )
    }
}
