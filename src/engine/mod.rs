//! Turn Queue & Settlement Engine
//!
//! The concurrency-bearing core of the game backend:
//! 1. Turn queue: rotate, eliminate, and time out turns under concurrent
//!    triggers, at most one advance per deadline (conditioned writes)
//! 2. Event log: append-only, strictly ordered per-game audit trail
//! 3. Settlement: idempotent, partially-recoverable token payouts
//!
//! Architecture:
//! - Stateless workers share nothing but the SQLite store
//! - Every mutation is conditioned on the state read at the start
//! - Losing a race is an outcome, not an error

pub mod error;
pub mod queue;
pub mod rules;
pub mod settlement;
pub mod store;
pub mod sweep;

pub use error::{EngineError, SettleError};
pub use queue::{AdvanceOutcome, SubmitOptions, TurnEngine};
pub use rules::{rules_for, Advance, GameRules, Knockout, Piles, Split, Tribunal};
pub use settlement::{
    AddressResolver, HubResolverClient, LogNotifier, Notifier, PaperAddressBook, PaperTransfer,
    PushNotifierClient, ResolvedPayout, SettleOutcome, SettlementResolver, TokenTransfer,
    TreasuryClient,
};
pub use store::GameStore;
pub use sweep::{SweepStats, SweepWorker, SweepWorkerConfig};
