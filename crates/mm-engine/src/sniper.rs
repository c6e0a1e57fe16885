//! Directional sniper engine.
//!
//! A second orchestrator variant sharing market discovery and
//! settlement with the market maker. Instead of quoting both sides it
//! watches for live spot to diverge from a market's strike late in the
//! window and takes a single taker position on the side spot already
//! favors, sized by divergence magnitude. Positions are never exited
//! before expiry; winners are redeemed on-chain, losers expire
//! worthless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mm_common::{ActivityLog, CryptoAsset, Outcome, Side, SpotTick};
use mm_market::{
    BookEvent, BookStreamHandle, FoundMarket, MarketFinder, SpotCache, SpotEvent,
    SpotStreamHandle, TopOfBook,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::SniperConfig;
use crate::market::PendingRedeem;
use crate::router::{OrderRouter, PlaceOrder};
use crate::settlement::SettlementManager;

const MARKET_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const REDEEM_CHECK_INTERVAL: Duration = Duration::from_secs(45);

/// Venue fee on winning redemptions.
const RESOLUTION_FEE_RATE: Decimal = dec!(0.02);

/// Lifecycle of one watched market.
#[derive(Debug, Clone, PartialEq)]
pub enum SniperState {
    /// No position; waiting for spot to diverge inside the entry window.
    Watching,
    /// Position taken, held to expiry.
    Entered {
        outcome: Outcome,
        entry_price: Decimal,
        entered_at: DateTime<Utc>,
        size: Decimal,
    },
    /// Past end time. Terminal.
    Expired,
}

/// One market under sniper watch.
#[derive(Debug, Clone)]
pub struct SniperMarket {
    pub market_id: String,
    pub question: String,
    pub asset: CryptoAsset,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub end_time: DateTime<Utc>,
    pub strike: Option<Decimal>,
    pub neg_risk: bool,
    /// Top of book for the YES instrument.
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub state: SniperState,
}

impl SniperMarket {
    fn from_found(found: &FoundMarket) -> Self {
        Self {
            market_id: found.market_id.clone(),
            question: found.question.clone(),
            asset: found.asset,
            yes_token_id: found.yes_token_id.clone(),
            no_token_id: found.no_token_id.clone(),
            end_time: found.end_time,
            strike: found.strike,
            neg_risk: found.neg_risk,
            best_bid: None,
            best_ask: None,
            state: SniperState::Watching,
        }
    }

    fn minutes_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_seconds() as f64 / 60.0
    }

    /// Ask price for buying the given outcome, derived from the YES
    /// book (the NO ask is the complement of the YES bid).
    fn ask_for(&self, outcome: Outcome) -> Option<Decimal> {
        match outcome {
            Outcome::Yes => self.best_ask,
            Outcome::No => self.best_bid.map(|b| Decimal::ONE - b),
        }
    }
}

/// Collaborators for a sniper instance.
pub struct SniperEngineDeps {
    pub router: Arc<dyn OrderRouter>,
    pub finder: MarketFinder,
    pub settlement: SettlementManager,
    pub activity: Arc<ActivityLog>,
    pub spot_cache: Arc<SpotCache>,
    pub book_events: mpsc::Receiver<BookEvent>,
    pub spot_events: mpsc::Receiver<SpotEvent>,
    pub book_handle: Option<BookStreamHandle>,
    pub spot_handle: Option<SpotStreamHandle>,
}

pub struct SniperEngine {
    config: SniperConfig,
    router: Arc<dyn OrderRouter>,
    finder: MarketFinder,
    settlement: SettlementManager,
    activity: Arc<ActivityLog>,
    spot_cache: Arc<SpotCache>,
    book_handle: Option<BookStreamHandle>,
    spot_handle: Option<SpotStreamHandle>,

    markets: HashMap<String, SniperMarket>,
    realized_pnl: Decimal,

    book_events: Option<mpsc::Receiver<BookEvent>>,
    spot_events: Option<mpsc::Receiver<SpotEvent>>,
}

impl SniperEngine {
    pub fn new(config: SniperConfig, deps: SniperEngineDeps) -> Self {
        Self {
            config,
            router: deps.router,
            finder: deps.finder,
            settlement: deps.settlement,
            activity: deps.activity,
            spot_cache: deps.spot_cache,
            book_handle: deps.book_handle,
            spot_handle: deps.spot_handle,
            markets: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            book_events: Some(deps.book_events),
            spot_events: Some(deps.spot_events),
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn market(&self, market_id: &str) -> Option<&SniperMarket> {
        self.markets.get(market_id)
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (Some(mut book_events), Some(mut spot_events)) =
            (self.book_events.take(), self.spot_events.take())
        else {
            warn!("sniper started without event receivers");
            return;
        };

        let mut market_refresh = tokio::time::interval(MARKET_REFRESH_INTERVAL);
        let mut expiry_sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        let mut redeem_check = tokio::time::interval(REDEEM_CHECK_INTERVAL);

        info!("sniper loop starting");
        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = book_events.recv() => {
                    match event {
                        Some(event) => self.handle_book_event(event).await,
                        None => break,
                    }
                }
                event = spot_events.recv() => {
                    match event {
                        Some(event) => self.handle_spot_event(event).await,
                        None => break,
                    }
                }
                _ = market_refresh.tick() => self.refresh_markets().await,
                _ = expiry_sweep.tick() => self.sweep_expiry(Utc::now()),
                _ = redeem_check.tick() => self.settlement.poll_redeems(Utc::now()).await,
            }
        }

        info!("sniper stopping");
        if let Some(handle) = &self.book_handle {
            handle.close();
        }
        if let Some(handle) = &self.spot_handle {
            handle.close();
        }
    }

    pub async fn handle_book_event(&mut self, event: BookEvent) {
        match event {
            BookEvent::Top(top) => self.handle_top(top).await,
            BookEvent::Connected => {}
            BookEvent::Disconnected => {
                // A sniper holds to expiry regardless; a stale book only
                // blocks new entries.
                for market in self.markets.values_mut() {
                    market.best_bid = None;
                    market.best_ask = None;
                }
            }
        }
    }

    async fn handle_top(&mut self, top: TopOfBook) {
        let market_id = self
            .markets
            .values()
            .find(|m| m.yes_token_id == top.token_id)
            .map(|m| m.market_id.clone());
        let Some(market_id) = market_id else {
            return;
        };
        if let Some(market) = self.markets.get_mut(&market_id) {
            market.best_bid = Some(top.best_bid);
            market.best_ask = Some(top.best_ask);
        }
        self.try_enter(&market_id, Utc::now()).await;
    }

    pub async fn handle_spot_event(&mut self, event: SpotEvent) {
        if let SpotEvent::Tick(tick) = event {
            self.on_spot_tick(tick).await;
        }
    }

    async fn on_spot_tick(&mut self, tick: SpotTick) {
        let ids: Vec<String> = self
            .markets
            .values()
            .filter(|m| m.asset == tick.asset && m.state == SniperState::Watching)
            .map(|m| m.market_id.clone())
            .collect();
        for id in ids {
            self.try_enter(&id, tick.timestamp).await;
        }
    }

    pub async fn refresh_markets(&mut self) {
        let now = Utc::now();
        let found = match self.finder.scan(now).await {
            Ok(found) => found,
            Err(e) => {
                warn!("sniper market scan failed: {e}");
                return;
            }
        };
        let mut added = false;
        for market in found {
            if self.markets.contains_key(&market.market_id) {
                continue;
            }
            debug!(
                market = %market.market_id,
                asset = %market.asset,
                strike = ?market.strike,
                "sniper watching market"
            );
            self.markets
                .insert(market.market_id.clone(), SniperMarket::from_found(&market));
            added = true;
        }
        if added {
            self.sync_subscriptions().await;
        }
    }

    /// Entry check for one market. All gates must pass at once; any
    /// failure just leaves the market watching.
    pub async fn try_enter(&mut self, market_id: &str, now: DateTime<Utc>) {
        let decision = {
            let Some(market) = self.markets.get(market_id) else {
                return;
            };
            if market.state != SniperState::Watching {
                return;
            }
            let minutes = market.minutes_remaining(now);
            if minutes < self.config.min_minutes_left || minutes > self.config.max_minutes_left {
                return;
            }
            let Some(strike) = market.strike else {
                return;
            };
            if strike <= Decimal::ZERO {
                return;
            }
            let Some(spot) = self.spot_cache.latest(market.asset, now) else {
                return;
            };

            let divergence = (spot.price - strike) / strike;
            let Some(size) = self.tier_size(divergence.abs()) else {
                return;
            };
            // Spot above strike favors YES, below favors NO.
            let outcome = if divergence > Decimal::ZERO {
                Outcome::Yes
            } else {
                Outcome::No
            };
            let Some(ask) = market.ask_for(outcome) else {
                return;
            };
            if ask <= Decimal::ZERO || ask > self.config.max_token_price {
                return;
            }
            (outcome, ask, size, divergence)
        };
        let (outcome, ask, size, divergence) = decision;

        if self.entered_count() >= self.config.max_concurrent_positions {
            return;
        }
        if self.total_exposure() + ask * size > self.config.max_exposure {
            debug!(market = market_id, "sniper exposure cap reached");
            return;
        }

        let token_id = {
            let Some(market) = self.markets.get(market_id) else {
                return;
            };
            match outcome {
                Outcome::Yes => market.yes_token_id.clone(),
                Outcome::No => market.no_token_id.clone(),
            }
        };

        let order = PlaceOrder {
            token_id,
            side: Side::Buy,
            price: ask,
            size,
            post_only: false,
        };
        match self.router.place_order(&order).await {
            Ok(placed) => {
                info!(
                    market = market_id,
                    outcome = %outcome,
                    price = %ask,
                    size = %size,
                    divergence = %divergence,
                    order = %placed.order_id,
                    "sniper entered"
                );
                self.activity.info(
                    "sniper_entry",
                    format!("bought {size} {outcome} @ {ask}"),
                    json!({
                        "market_id": market_id,
                        "outcome": outcome,
                        "price": ask,
                        "size": size,
                        "divergence": divergence,
                    }),
                );
                if let Some(market) = self.markets.get_mut(market_id) {
                    market.state = SniperState::Entered {
                        outcome,
                        entry_price: ask,
                        entered_at: now,
                        size,
                    };
                }
            }
            Err(e) => {
                warn!(market = market_id, "sniper entry failed: {e}");
            }
        }
    }

    /// Three sizing tiers by divergence magnitude; below the entry
    /// threshold there is no trade.
    fn tier_size(&self, divergence: Decimal) -> Option<Decimal> {
        if divergence >= self.config.tier3_diff_pct {
            Some(self.config.tier3_size)
        } else if divergence >= self.config.tier2_diff_pct {
            Some(self.config.tier2_size)
        } else if divergence >= self.config.min_price_diff_pct {
            Some(self.config.tier1_size)
        } else {
            None
        }
    }

    fn entered_count(&self) -> usize {
        self.markets
            .values()
            .filter(|m| matches!(m.state, SniperState::Entered { .. }))
            .count()
    }

    /// Sum of entry cost across open positions.
    fn total_exposure(&self) -> Decimal {
        self.markets
            .values()
            .filter_map(|m| match &m.state {
                SniperState::Entered {
                    entry_price, size, ..
                } => Some(*entry_price * *size),
                _ => None,
            })
            .sum()
    }

    /// Retire expired markets. Entered positions go to PendingRedeem;
    /// the win/loss estimate is recorded off the last spot print and
    /// trued up by actual redemption.
    pub fn sweep_expiry(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .markets
            .values()
            .filter(|m| now >= m.end_time)
            .map(|m| m.market_id.clone())
            .collect();

        for id in expired {
            let Some(market) = self.markets.remove(&id) else {
                continue;
            };
            let SniperState::Entered {
                outcome,
                entry_price,
                size,
                ..
            } = market.state
            else {
                debug!(market = %id, "watched market expired without entry");
                continue;
            };

            let won = self.position_won(&market, outcome, now);
            let pnl = match won {
                Some(true) => (Decimal::ONE - entry_price) * size * (Decimal::ONE - RESOLUTION_FEE_RATE),
                Some(false) => -(entry_price * size),
                None => Decimal::ZERO,
            };
            self.realized_pnl += pnl;
            self.activity.info(
                "sniper_expired",
                format!("{} {outcome} position expired", market.asset),
                json!({
                    "market_id": id,
                    "outcome": outcome,
                    "entry_price": entry_price,
                    "size": size,
                    "won": won,
                    "pnl": pnl,
                }),
            );
            self.settlement.queue_redeem(PendingRedeem {
                market_id: id,
                neg_risk: market.neg_risk,
                yes_token_id: market.yes_token_id,
                no_token_id: market.no_token_id,
                asset: market.asset,
                added_at: now,
            });
        }
    }

    /// Did the position finish in the money, judged from the last spot
    /// print? `None` when no fresh spot or strike is available.
    fn position_won(
        &self,
        market: &SniperMarket,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        let strike = market.strike?;
        let spot = self.spot_cache.latest(market.asset, now)?;
        let above = spot.price >= strike;
        Some(match outcome {
            Outcome::Yes => above,
            Outcome::No => !above,
        })
    }

    async fn sync_subscriptions(&self) {
        if let Some(handle) = &self.book_handle {
            let tokens: Vec<String> = self
                .markets
                .values()
                .map(|m| m.yes_token_id.clone())
                .collect();
            handle.set_tokens(tokens).await;
        }
    }
}
