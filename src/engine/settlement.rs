//! Settlement resolver and payout collaborators
//!
//! Turns a terminal game into paid-out winners exactly once. The token
//! transfer is the only non-idempotent side effect in the engine, so it is
//! guarded by the already-settled short-circuit (and the conditioned status
//! flip inside the settlement transaction), never by rollback: on-chain
//! transfers cannot be unwound.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::SettleError;
use super::store::GameStore;
use crate::models::{
    EventKind, GameRecord, GameStatus, SettlementRecord, StakingContext, TokenScope, WinnerShare,
};

/// A winner with a resolved payout address, ready for the transfer call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPayout {
    pub participant_id: String,
    pub address: String,
    pub amount: String,
    pub position: u32,
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Must be safe to call repeatedly with the same inputs.
    async fn resolve_addresses(
        &self,
        participant_ids: &[String],
        ctx: &StakingContext,
    ) -> Result<HashMap<String, String>>;
}

#[async_trait]
pub trait TokenTransfer: Send + Sync {
    /// One transaction reference per payout, in input order, or a reportable
    /// failure. Never partially applied from the caller's point of view.
    async fn transfer(&self, payouts: &[ResolvedPayout], scope: &TokenScope)
        -> Result<Vec<String>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire-and-forget; callers log failures and move on.
    async fn notify(&self, participant_id: &str, message: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP collaborators
// ---------------------------------------------------------------------------

fn http_client(api_key: &str) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .default_headers({
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {api_key}")
                    .parse()
                    .context("invalid collaborator api key")?,
            );
            headers
        })
        .build()
        .context("failed to build collaborator http client")
}

/// Address resolution via the community hub service.
#[derive(Clone)]
pub struct HubResolverClient {
    client: Client,
    base_url: String,
}

impl HubResolverClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(api_key)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AddressResolver for HubResolverClient {
    async fn resolve_addresses(
        &self,
        participant_ids: &[String],
        ctx: &StakingContext,
    ) -> Result<HashMap<String, String>> {
        #[derive(Serialize)]
        struct Req<'a> {
            participant_ids: &'a [String],
            context: &'a StakingContext,
        }
        #[derive(Deserialize)]
        struct Resp {
            addresses: HashMap<String, String>,
        }

        let url = format!("{}/v1/addresses/resolve", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&Req {
                participant_ids,
                context: ctx,
            })
            .send()
            .await
            .context("POST /v1/addresses/resolve failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("POST /v1/addresses/resolve {status}: {text}"));
        }

        Ok(resp
            .json::<Resp>()
            .await
            .context("decode address resolution response")?
            .addresses)
    }
}

/// Batched token transfers via the treasury service.
#[derive(Clone)]
pub struct TreasuryClient {
    client: Client,
    base_url: String,
}

impl TreasuryClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(api_key)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenTransfer for TreasuryClient {
    async fn transfer(
        &self,
        payouts: &[ResolvedPayout],
        scope: &TokenScope,
    ) -> Result<Vec<String>> {
        #[derive(Serialize)]
        struct Req<'a> {
            payouts: &'a [ResolvedPayout],
            scope: &'a TokenScope,
        }
        #[derive(Deserialize)]
        struct Resp {
            tx_refs: Vec<String>,
        }

        let url = format!("{}/v1/transfers/batch", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&Req { payouts, scope })
            .send()
            .await
            .context("POST /v1/transfers/batch failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("POST /v1/transfers/batch {status}: {text}"));
        }

        Ok(resp
            .json::<Resp>()
            .await
            .context("decode transfer response")?
            .tx_refs)
    }
}

/// Push notification relay.
#[derive(Clone)]
pub struct PushNotifierClient {
    client: Client,
    base_url: String,
}

impl PushNotifierClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(api_key)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for PushNotifierClient {
    async fn notify(&self, participant_id: &str, message: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            participant_id: &'a str,
            message: &'a str,
        }

        let url = format!("{}/v1/notifications", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&Req {
                participant_id,
                message,
            })
            .send()
            .await
            .context("POST /v1/notifications failed")?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "POST /v1/notifications {}",
                resp.status()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paper collaborators (dev / tests)
// ---------------------------------------------------------------------------

/// Derives a stable fake address per participant so repeated resolution is
/// idempotent, like the real hub.
#[derive(Debug, Clone, Default)]
pub struct PaperAddressBook;

fn derive_address(participant_id: &str) -> String {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, participant_id.as_bytes());
    format!("0x{}", hex::encode(uuid.as_bytes()))
}

#[async_trait]
impl AddressResolver for PaperAddressBook {
    async fn resolve_addresses(
        &self,
        participant_ids: &[String],
        _ctx: &StakingContext,
    ) -> Result<HashMap<String, String>> {
        Ok(participant_ids
            .iter()
            .map(|id| (id.clone(), derive_address(id)))
            .collect())
    }
}

/// Paper transfer: deterministic uuid-v5 transaction references, simulated
/// latency, and a batch counter the tests lean on.
#[derive(Debug, Default)]
pub struct PaperTransfer {
    pub latency_jitter_ms: u64,
    batches: AtomicUsize,
}

impl PaperTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenTransfer for PaperTransfer {
    async fn transfer(
        &self,
        payouts: &[ResolvedPayout],
        scope: &TokenScope,
    ) -> Result<Vec<String>> {
        if self.latency_jitter_ms > 0 {
            let mut rng = StdRng::from_entropy();
            let jitter: u64 = rng.gen_range(0..=self.latency_jitter_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(payouts
            .iter()
            .map(|p| {
                let seed = format!(
                    "gauntlet:payout:{}:{}:{}:{}",
                    scope.token_address, p.participant_id, p.amount, p.position
                );
                format!("0x{}", hex::encode(Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).as_bytes()))
            })
            .collect())
    }
}

/// Log-only notifier.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, participant_id: &str, message: &str) -> Result<()> {
        info!(participant_id, message, "notify");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// This call transferred and recorded the payout.
    Settled {
        records: Vec<SettlementRecord>,
        primary_tx: String,
    },
    /// A prior call already settled the game; its durable result, unchanged.
    AlreadySettled {
        records: Vec<SettlementRecord>,
        primary_tx: Option<String>,
    },
}

impl SettleOutcome {
    pub fn records(&self) -> &[SettlementRecord] {
        match self {
            SettleOutcome::Settled { records, .. } => records,
            SettleOutcome::AlreadySettled { records, .. } => records,
        }
    }
}

pub struct SettlementResolver {
    store: GameStore,
    addresses: Arc<dyn AddressResolver>,
    transfers: Arc<dyn TokenTransfer>,
    notifier: Arc<dyn Notifier>,
}

impl SettlementResolver {
    pub fn new(
        store: GameStore,
        addresses: Arc<dyn AddressResolver>,
        transfers: Arc<dyn TokenTransfer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            addresses,
            transfers,
            notifier,
        }
    }

    /// Pay out a terminal game, exactly once. Safe to re-run with the same
    /// inputs after any retryable failure or crash: an already settled game
    /// short-circuits to its durable result without touching the chain.
    pub async fn settle(
        &self,
        game_id: &str,
        winners: &[WinnerShare],
    ) -> Result<SettleOutcome, SettleError> {
        let game = self
            .store
            .get_game(game_id)
            .await?
            .ok_or_else(|| SettleError::GameNotFound(game_id.to_string()))?;

        match game.status {
            GameStatus::Settled => {
                let records = self.store.settlements_for(game_id).await?;
                return Ok(SettleOutcome::AlreadySettled {
                    records,
                    primary_tx: game.settlement_tx,
                });
            }
            GameStatus::Cancelled => return Err(SettleError::Cancelled(game_id.to_string())),
            GameStatus::Open => {
                return Err(SettleError::WrongStatus {
                    game_id: game_id.to_string(),
                    status: game.status.as_str().to_string(),
                })
            }
            GameStatus::InProgress => {}
        }

        let payouts = Self::validate_winners(&game, winners)?;

        // Deterministic lookup order keeps retries idempotent on the hub side.
        let mut lookup_ids: Vec<String> =
            payouts.iter().map(|w| w.participant_id.clone()).collect();
        lookup_ids.sort();
        let address_book = self
            .addresses
            .resolve_addresses(&lookup_ids, &game.staking_context())
            .await
            .map_err(|e| SettleError::AddressResolution(e.to_string()))?;

        let payouts: Vec<ResolvedPayout> = payouts
            .into_iter()
            .map(|mut p| {
                match address_book.get(&p.participant_id) {
                    Some(addr) => {
                        p.address = addr.clone();
                        Ok(p)
                    }
                    None => Err(SettleError::MissingAddress(p.participant_id.clone())),
                }
            })
            .collect::<Result<_, _>>()?;

        let tx_refs = self
            .transfers
            .transfer(&payouts, &game.scope)
            .await
            .map_err(|e| SettleError::Transfer(e.to_string()))?;

        if tx_refs.len() != payouts.len() {
            // Data-corruption guard: some winners would be marked paid with
            // no on-chain evidence (or vice versa). Nothing is written.
            error!(
                game_id,
                expected = payouts.len(),
                got = tx_refs.len(),
                "transfer reference count mismatch, settlement aborted"
            );
            return Err(SettleError::TxCountMismatch {
                expected: payouts.len(),
                got: tx_refs.len(),
            });
        }

        let settled_at = Utc::now().timestamp();
        let records: Vec<SettlementRecord> = payouts
            .iter()
            .zip(tx_refs.iter())
            .map(|(p, tx_ref)| SettlementRecord {
                game_id: game_id.to_string(),
                winner_id: p.participant_id.clone(),
                position: p.position as i64,
                amount: p.amount.clone(),
                tx_ref: tx_ref.clone(),
                settled_at,
            })
            .collect();
        let primary_tx = tx_refs[0].clone();

        let committed = self
            .store
            .record_settlement(game_id, &records, &primary_tx)
            .await?;
        if !committed {
            // Lost the status-flip race; the winner's records stand.
            warn!(game_id, "settlement raced a concurrent settle, keeping the first result");
            let records = self.store.settlements_for(game_id).await?;
            let game = self.store.get_game(game_id).await?;
            return Ok(SettleOutcome::AlreadySettled {
                records,
                primary_tx: game.and_then(|g| g.settlement_tx),
            });
        }

        info!(
            game_id,
            winners = records.len(),
            primary_tx = %primary_tx,
            "game settled"
        );

        // Durable state is committed; everything past here is best-effort.
        if let Err(e) = self
            .store
            .append_event(
                game_id,
                "system",
                EventKind::Settled,
                serde_json::json!({ "primary_tx": primary_tx, "winners": records.len() }),
            )
            .await
        {
            warn!(game_id, error = %e, "settled event append failed");
        }

        for rec in &records {
            let message = format!(
                "you placed #{} and won {} (tx {})",
                rec.position, rec.amount, rec.tx_ref
            );
            if let Err(e) = self.notifier.notify(&rec.winner_id, &message).await {
                warn!(winner = %rec.winner_id, error = %e, "winner notification failed");
            }
        }

        Ok(SettleOutcome::Settled {
            records,
            primary_tx,
        })
    }

    /// Whole-batch validation: any violation rejects the settlement with no
    /// partial write.
    fn validate_winners(
        game: &GameRecord,
        winners: &[WinnerShare],
    ) -> Result<Vec<ResolvedPayout>, SettleError> {
        if winners.is_empty() {
            return Err(SettleError::NoWinners);
        }

        let pot = game.pot_units().unwrap_or_default();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut total = BigUint::default();
        let mut payouts = Vec::with_capacity(winners.len());

        for w in winners {
            if !game.is_participant(&w.participant_id) {
                return Err(SettleError::UnknownWinner(w.participant_id.clone()));
            }
            if !seen.insert(w.participant_id.as_str()) {
                return Err(SettleError::DuplicateWinner(w.participant_id.clone()));
            }
            let amount = w
                .amount_units()
                .ok_or_else(|| SettleError::BadAmount(w.participant_id.clone()))?;
            total += &amount;
            payouts.push(ResolvedPayout {
                participant_id: w.participant_id.clone(),
                address: String::new(),
                amount: w.amount.clone(),
                position: w.position,
            });
        }

        if total > pot {
            return Err(SettleError::OverPay);
        }

        Ok(payouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GameKind, GameRecord};

    struct ShortTransfer;

    #[async_trait]
    impl TokenTransfer for ShortTransfer {
        async fn transfer(
            &self,
            payouts: &[ResolvedPayout],
            _scope: &TokenScope,
        ) -> Result<Vec<String>> {
            Ok(payouts
                .iter()
                .skip(1)
                .map(|p| format!("0x{}", p.participant_id))
                .collect())
        }
    }

    struct FailingTransfer;

    #[async_trait]
    impl TokenTransfer for FailingTransfer {
        async fn transfer(
            &self,
            _payouts: &[ResolvedPayout],
            _scope: &TokenScope,
        ) -> Result<Vec<String>> {
            Err(anyhow::anyhow!("rpc unavailable"))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl AddressResolver for FailingResolver {
        async fn resolve_addresses(
            &self,
            _participant_ids: &[String],
            _ctx: &StakingContext,
        ) -> Result<HashMap<String, String>> {
            Err(anyhow::anyhow!("hub timeout"))
        }
    }

    fn temp_store() -> (tempfile::TempDir, GameStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.db");
        let store = GameStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    async fn terminal_game(store: &GameStore, players: &[&str], pot: u32) -> GameRecord {
        let mut game = GameRecord::open(
            GameKind::Knockout,
            "test-community",
            TokenScope {
                chain_id: 8453,
                token_address: "0xtoken".into(),
            },
            players.iter().map(|p| p.to_string()).collect(),
            &BigUint::from(pot),
            300,
        );
        game.start(1_700_000_000);
        game.current_turn = None;
        game.turn_deadline = None;
        store.insert_game(&game).await.unwrap();
        game
    }

    fn resolver_with(
        store: &GameStore,
        transfers: Arc<dyn TokenTransfer>,
    ) -> SettlementResolver {
        SettlementResolver::new(
            store.clone(),
            Arc::new(PaperAddressBook),
            transfers,
            Arc::new(LogNotifier),
        )
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let (_dir, store) = temp_store();
        let game = terminal_game(&store, &["a", "b"], 1000).await;
        let transfers = Arc::new(PaperTransfer::new());
        let resolver = resolver_with(&store, transfers.clone());

        let winners = vec![WinnerShare {
            participant_id: "a".into(),
            amount: "1000".into(),
            position: 1,
        }];

        let first = resolver.settle(&game.id, &winners).await.unwrap();
        let SettleOutcome::Settled { records, primary_tx } = first else {
            panic!("first settle must transfer");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(transfers.batches(), 1);

        let second = resolver.settle(&game.id, &winners).await.unwrap();
        let SettleOutcome::AlreadySettled {
            records: replay,
            primary_tx: replay_tx,
        } = second
        else {
            panic!("second settle must short-circuit");
        };
        assert_eq!(replay, records);
        assert_eq!(replay_tx.as_deref(), Some(primary_tx.as_str()));
        assert_eq!(transfers.batches(), 1);

        // Settled event trailed the durable write.
        let events = store.list_events(&game.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Settled);
    }

    #[tokio::test]
    async fn count_mismatch_writes_nothing() {
        let (_dir, store) = temp_store();
        let game = terminal_game(&store, &["a", "b", "c"], 900).await;
        let resolver = resolver_with(&store, Arc::new(ShortTransfer));

        let winners = vec![
            WinnerShare {
                participant_id: "a".into(),
                amount: "450".into(),
                position: 1,
            },
            WinnerShare {
                participant_id: "b".into(),
                amount: "450".into(),
                position: 2,
            },
        ];

        let err = resolver.settle(&game.id, &winners).await.unwrap_err();
        assert!(matches!(
            err,
            SettleError::TxCountMismatch {
                expected: 2,
                got: 1
            }
        ));
        assert!(!err.is_retryable());

        let loaded = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, GameStatus::InProgress);
        assert!(store.settlements_for(&game.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collaborator_failures_are_retryable() {
        let (_dir, store) = temp_store();
        let game = terminal_game(&store, &["a", "b"], 1000).await;
        let winners = vec![WinnerShare {
            participant_id: "b".into(),
            amount: "1000".into(),
            position: 1,
        }];

        let err = resolver_with(&store, Arc::new(FailingTransfer))
            .settle(&game.id, &winners)
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::Transfer(_)));
        assert!(err.is_retryable());

        let failing_resolver = SettlementResolver::new(
            store.clone(),
            Arc::new(FailingResolver),
            Arc::new(PaperTransfer::new()),
            Arc::new(LogNotifier),
        );
        let err = failing_resolver.settle(&game.id, &winners).await.unwrap_err();
        assert!(matches!(err, SettleError::AddressResolution(_)));
        assert!(err.is_retryable());

        // Still retryable for real: a working transfer finishes the job.
        let outcome = resolver_with(&store, Arc::new(PaperTransfer::new()))
            .settle(&game.id, &winners)
            .await
            .unwrap();
        assert!(matches!(outcome, SettleOutcome::Settled { .. }));
    }

    #[tokio::test]
    async fn batch_validation_rejects_everything_or_nothing() {
        let (_dir, store) = temp_store();
        let game = terminal_game(&store, &["a", "b"], 1000).await;
        let resolver = resolver_with(&store, Arc::new(PaperTransfer::new()));

        let err = resolver.settle(&game.id, &[]).await.unwrap_err();
        assert!(matches!(err, SettleError::NoWinners));

        let stranger = vec![WinnerShare {
            participant_id: "mallory".into(),
            amount: "1".into(),
            position: 1,
        }];
        let err = resolver.settle(&game.id, &stranger).await.unwrap_err();
        assert!(matches!(err, SettleError::UnknownWinner(_)));

        let overpay = vec![WinnerShare {
            participant_id: "a".into(),
            amount: "1001".into(),
            position: 1,
        }];
        let err = resolver.settle(&game.id, &overpay).await.unwrap_err();
        assert!(matches!(err, SettleError::OverPay));

        let dupes = vec![
            WinnerShare {
                participant_id: "a".into(),
                amount: "400".into(),
                position: 1,
            },
            WinnerShare {
                participant_id: "a".into(),
                amount: "400".into(),
                position: 2,
            },
        ];
        let err = resolver.settle(&game.id, &dupes).await.unwrap_err();
        assert!(matches!(err, SettleError::DuplicateWinner(_)));

        assert!(store.settlements_for(&game.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_games_never_settle() {
        let (_dir, store) = temp_store();
        let game = terminal_game(&store, &["a", "b"], 1000).await;
        store.cancel_game(&game.id).await.unwrap();

        let resolver = resolver_with(&store, Arc::new(PaperTransfer::new()));
        let err = resolver
            .settle(
                &game.id,
                &[WinnerShare {
                    participant_id: "a".into(),
                    amount: "1000".into(),
                    position: 1,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::Cancelled(_)));
    }

    #[test]
    fn paper_addresses_are_stable() {
        assert_eq!(derive_address("alice"), derive_address("alice"));
        assert_ne!(derive_address("alice"), derive_address("bob"));
        assert!(derive_address("alice").starts_with("0x"));
    }
}
