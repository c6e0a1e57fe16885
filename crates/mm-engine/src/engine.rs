//! The market-making engine loop.
//!
//! One `MmEngine` runs per profile and exclusively owns its
//! `ActiveMarket` records. A single dispatch loop consumes book and spot
//! events and a set of independent timers; every external effect (order
//! placement, cancel, settlement) happens from this loop, which is what
//! makes the per-market concurrency invariants cheap to enforce:
//! `last_quote_time` is written before any placement network call, a
//! market with a filled side is never requoted, and cancels complete
//! (or are logged as best-effort failures) before replacements go out.
//!
//! The tick bodies are public so tests can drive the engine
//! deterministically without the timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mm_common::{ActivityLog, CryptoAsset, Outcome, Side};
use mm_market::{
    BookEvent, BookStreamHandle, CandleSource, HistoricalSpot, MarketCatalog, MarketFinder,
    MetadataCache, SpotCache, SpotEvent, SpotQuote, SpotStreamHandle, TopOfBook,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::balance::BalanceCache;
use crate::breaker::SpotVelocityBreaker;
use crate::config::EngineConfig;
use crate::fills::{FillReconciler, ReconcileEvent};
use crate::market::{ActiveMarket, PendingRedeem, RestingOrder};
use crate::model::fair_value::{analyze_mispricing, realized_vol_garman_klass};
use crate::model::volatility::{Regime, VolatilityClassifier};
use crate::quote::{apply_fair_value_bias, quote_for, QuoteInputs, QuotePair};
use crate::router::{OrderRouter, PlaceOrder};
use crate::settlement::SettlementManager;

const MARKET_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
const VOLATILITY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const FILL_CHECK_INTERVAL: Duration = Duration::from_secs(4);
const REDEEM_CHECK_INTERVAL: Duration = Duration::from_secs(45);
const REALIZED_VOL_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Breaker sampling cadence; tighter when fair-value mode is quoting
/// off the model.
fn breaker_check_interval(fair_value_enabled: bool) -> Duration {
    if fair_value_enabled {
        Duration::from_secs(2)
    } else {
        Duration::from_secs(5)
    }
}

/// Everything the engine talks to. Streams hand their event receivers
/// over here; handles are optional so tests can inject events directly.
pub struct MmEngineDeps {
    pub router: Arc<dyn OrderRouter>,
    pub catalog: Arc<dyn MarketCatalog>,
    pub history: Arc<dyn HistoricalSpot>,
    pub candles: Arc<dyn CandleSource>,
    pub spot_quote: Arc<dyn SpotQuote>,
    pub metadata: Arc<MetadataCache>,
    pub settlement: SettlementManager,
    pub activity: Arc<ActivityLog>,
    pub spot_cache: Arc<SpotCache>,
    pub book_events: mpsc::Receiver<BookEvent>,
    pub spot_events: mpsc::Receiver<SpotEvent>,
    pub book_handle: Option<BookStreamHandle>,
    pub spot_handle: Option<SpotStreamHandle>,
}

pub struct MmEngine {
    config: EngineConfig,
    router: Arc<dyn OrderRouter>,
    spot_quote: Arc<dyn SpotQuote>,
    candles: Arc<dyn CandleSource>,
    metadata: Arc<MetadataCache>,
    activity: Arc<ActivityLog>,
    spot_cache: Arc<SpotCache>,
    book_handle: Option<BookStreamHandle>,
    spot_handle: Option<SpotStreamHandle>,

    finder: MarketFinder,
    classifier: VolatilityClassifier,
    breaker: SpotVelocityBreaker,
    balance: Arc<BalanceCache>,
    reconciler: FillReconciler,
    settlement: SettlementManager,

    markets: HashMap<String, ActiveMarket>,
    /// Annualized realized vol per asset, refreshed on a timer in
    /// fair-value mode.
    realized_sigma: HashMap<CryptoAsset, f64>,
    realized_profit: Decimal,

    book_events: Option<mpsc::Receiver<BookEvent>>,
    spot_events: Option<mpsc::Receiver<SpotEvent>>,
}

impl MmEngine {
    pub fn new(config: EngineConfig, deps: MmEngineDeps) -> Self {
        let finder = MarketFinder::new(
            Arc::clone(&deps.catalog),
            Arc::clone(&deps.history),
            mm_market::FinderConfig::new(config.assets.clone(), config.mode),
        );
        let classifier = VolatilityClassifier::new(
            Arc::clone(&deps.candles),
            config.assets.first().copied().unwrap_or(CryptoAsset::Btc),
            config.mode.candle_interval(),
            config.volatility_lookback,
        );
        let breaker = SpotVelocityBreaker::new(config.circuit_breaker_pct);
        let balance = Arc::new(BalanceCache::new(Arc::clone(&deps.router)));
        let reconciler = FillReconciler::new(
            Arc::clone(&deps.router),
            Arc::clone(&balance),
            config.one_side_fill_timeout,
        );

        Self {
            router: deps.router,
            spot_quote: deps.spot_quote,
            candles: deps.candles,
            metadata: deps.metadata,
            activity: deps.activity,
            spot_cache: deps.spot_cache,
            book_handle: deps.book_handle,
            spot_handle: deps.spot_handle,
            finder,
            classifier,
            breaker,
            balance,
            reconciler,
            settlement: deps.settlement,
            markets: HashMap::new(),
            realized_sigma: HashMap::new(),
            realized_profit: Decimal::ZERO,
            book_events: Some(deps.book_events),
            spot_events: Some(deps.spot_events),
            config,
        }
    }

    pub fn realized_profit(&self) -> Decimal {
        self.realized_profit
    }

    pub fn market(&self, market_id: &str) -> Option<&ActiveMarket> {
        self.markets.get(market_id)
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn regime(&self) -> Regime {
        self.classifier.regime()
    }

    /// Pin the volatility regime until the next scheduled
    /// reclassification.
    pub fn force_regime(&mut self, regime: Regime) {
        self.classifier.force_regime(regime);
    }

    pub async fn refresh_volatility(&mut self) -> Regime {
        self.classifier.refresh().await
    }

    /// Drive the engine until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (Some(mut book_events), Some(mut spot_events)) =
            (self.book_events.take(), self.spot_events.take())
        else {
            warn!("engine started without event receivers");
            return;
        };

        let mut market_refresh = tokio::time::interval(MARKET_REFRESH_INTERVAL);
        let mut volatility_refresh = tokio::time::interval(VOLATILITY_REFRESH_INTERVAL);
        let mut expiry_sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        let mut breaker_check =
            tokio::time::interval(breaker_check_interval(self.config.fair_value_enabled));
        let mut fill_check = tokio::time::interval(FILL_CHECK_INTERVAL);
        let mut redeem_check = tokio::time::interval(REDEEM_CHECK_INTERVAL);
        let mut realized_vol_refresh = tokio::time::interval(REALIZED_VOL_REFRESH_INTERVAL);
        let mut quote_refresh = tokio::time::interval(self.config.quote_refresh);

        info!(
            mode = %self.config.mode,
            assets = ?self.config.assets,
            fair_value = self.config.fair_value_enabled,
            "engine loop starting"
        );

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
                        None => {
                            warn!("book event channel closed");
                            break;
                        }
                    }
                }
                event = spot_events.recv() => {
                    match event {
                        Some(event) => self.handle_spot_event(event).await,
                        None => {
                            warn!("spot event channel closed");
                            break;
                        }
                    }
                }
                _ = market_refresh.tick() => self.refresh_markets().await,
                _ = volatility_refresh.tick() => {
                    self.refresh_volatility().await;
                }
                _ = expiry_sweep.tick() => self.sweep_expiry(Utc::now()).await,
                _ = breaker_check.tick() => self.check_breaker(Utc::now()).await,
                _ = fill_check.tick() => self.check_fills(Utc::now()).await,
                _ = redeem_check.tick() => self.settlement.poll_redeems(Utc::now()).await,
                _ = realized_vol_refresh.tick(),
                        if self.config.fair_value_enabled => {
                    self.refresh_realized_vol().await;
                }
                _ = quote_refresh.tick() => self.requote_all().await,
            }
        }

        self.stop().await;
    }

    /// Shutdown in order: streams first so no stale book can trigger a
    /// quote, then best-effort cancel of everything resting.
    async fn stop(&mut self) {
        info!("engine stopping");
        if let Some(handle) = &self.book_handle {
            handle.close();
        }
        if let Some(handle) = &self.spot_handle {
            handle.close();
        }
        self.cancel_all_quotes("shutdown").await;
    }

    // ------------------------------------------------------------------
    // Stream event handlers
    // ------------------------------------------------------------------

    pub async fn handle_book_event(&mut self, event: BookEvent) {
        match event {
            BookEvent::Top(top) => self.handle_top(top).await,
            BookEvent::Connected => {
                debug!("book stream connected");
            }
            BookEvent::Disconnected => {
                // Never trade against a book we can no longer see.
                warn!("book stream disconnected, pulling all quotes");
                for market in self.markets.values_mut() {
                    market.clear_book();
                }
                self.cancel_all_quotes("book stream disconnected").await;
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
            market.update_book(top.best_bid, top.best_ask);
        }
        self.maybe_quote(&market_id).await;
    }

    pub async fn handle_spot_event(&mut self, event: SpotEvent) {
        match event {
            SpotEvent::Tick(tick) => {
                if self
                    .breaker
                    .record(tick.asset, tick.price, tick.timestamp)
                    .is_some()
                {
                    self.on_breaker_trip(tick.asset).await;
                }
            }
            SpotEvent::Connected => {
                debug!("spot stream connected");
            }
            SpotEvent::Disconnected => {
                debug!("spot stream disconnected");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer bodies
    // ------------------------------------------------------------------

    /// Discover new markets and keep the book subscription set current.
    pub async fn refresh_markets(&mut self) {
        let now = Utc::now();
        let found = match self.finder.scan(now).await {
            Ok(found) => found,
            Err(e) => {
                warn!("market scan failed: {e}");
                return;
            }
        };

        let mut added = false;
        for market in found {
            if self.markets.contains_key(&market.market_id) {
                continue;
            }
            // One market per asset at a time.
            if self.markets.values().any(|m| m.asset == market.asset) {
                continue;
            }
            info!(
                market = %market.market_id,
                asset = %market.asset,
                question = %market.question,
                minutes_left = market.minutes_remaining(now),
                "tracking new market"
            );
            self.activity.info(
                "market_added",
                format!("{}: {}", market.asset, market.question),
                json!({"market_id": market.market_id, "strike": market.strike}),
            );
            self.markets
                .insert(market.market_id.clone(), ActiveMarket::from_found(&market));
            added = true;
        }
        if added {
            self.sync_subscriptions().await;
        }
    }

    /// Pull quotes inside the pre-expiry lead, retire expired markets
    /// and hand leftover inventory to settlement.
    pub async fn sweep_expiry(&mut self, now: DateTime<Utc>) {
        let pull_lead = chrono::Duration::from_std(self.config.pre_expiry_pull)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let ids: Vec<String> = self.markets.keys().cloned().collect();
        let mut removed = false;
        for id in ids {
            let (expired, in_pull_window, has_orders) = match self.markets.get(&id) {
                Some(m) => (
                    m.is_expired(now),
                    now >= m.end_time - pull_lead,
                    m.has_resting_orders(),
                ),
                None => continue,
            };

            if !expired {
                if in_pull_window && has_orders {
                    self.pull_quotes(&id, "pre-expiry").await;
                }
                continue;
            }

            self.pull_quotes(&id, "expired").await;
            let Some(market) = self.markets.remove(&id) else {
                continue;
            };
            removed = true;
            if market.has_inventory() {
                info!(
                    market = %id,
                    yes = %market.yes_held,
                    no = %market.no_held,
                    "market expired with inventory, queueing redeem"
                );
                self.activity.info(
                    "market_expired",
                    format!("{} expired holding inventory", market.asset),
                    json!({"market_id": id, "yes_held": market.yes_held, "no_held": market.no_held}),
                );
                self.settlement
                    .queue_redeem(PendingRedeem::from_market(&market, now));
            } else {
                debug!(market = %id, "market expired flat");
            }
        }
        if removed {
            self.sync_subscriptions().await;
        }
    }

    /// Sample spot for every quoted asset. Prefers the push cache,
    /// falls back to a pull query when the cache is stale.
    pub async fn check_breaker(&mut self, now: DateTime<Utc>) {
        let assets: Vec<CryptoAsset> = {
            let mut assets: Vec<_> = self.markets.values().map(|m| m.asset).collect();
            assets.sort_by_key(|a| a.as_str());
            assets.dedup();
            assets
        };

        for asset in assets {
            let price = match self.spot_cache.latest(asset, now) {
                Some(tick) => Some(tick.price),
                None => self.spot_quote.latest_price(asset).await,
            };
            let Some(price) = price else {
                debug!(asset = %asset, "no spot price for breaker check");
                continue;
            };
            if self.breaker.record(asset, price, now).is_some() {
                self.on_breaker_trip(asset).await;
            }
        }
    }

    async fn on_breaker_trip(&mut self, asset: CryptoAsset) {
        self.activity.warn(
            "circuit_breaker",
            format!("{asset} moved too fast, halting quoting"),
            json!({"asset": asset.as_str()}),
        );
        self.cancel_all_quotes("circuit breaker").await;
        // Pinned until the next scheduled reclassification.
        self.classifier.force_regime(Regime::Volatile);
    }

    /// Reconcile fills across all markets off one open-order snapshot.
    pub async fn check_fills(&mut self, now: DateTime<Utc>) {
        let candidates: Vec<String> = self
            .markets
            .values()
            .filter(|m| m.has_resting_orders() || m.has_any_fill())
            .map(|m| m.market_id.clone())
            .collect();
        if candidates.is_empty() {
            return;
        }

        let snapshot = match self.reconciler.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("open-order snapshot failed: {e}");
                return;
            }
        };

        for id in candidates {
            let Some(mut market) = self.markets.remove(&id) else {
                continue;
            };
            let events = self
                .reconciler
                .check_market(&mut market, &snapshot, now)
                .await;
            let neg_risk = market.neg_risk;
            self.markets.insert(id.clone(), market);

            for event in events {
                self.handle_reconcile_event(&id, neg_risk, event).await;
            }
        }
    }

    async fn handle_reconcile_event(
        &mut self,
        market_id: &str,
        neg_risk: bool,
        event: ReconcileEvent,
    ) {
        match event {
            ReconcileEvent::Fill {
                outcome,
                entry_price,
                size,
                partial,
            } => {
                self.activity.info(
                    "fill_detected",
                    format!("{outcome} filled {size} @ {entry_price}"),
                    json!({
                        "market_id": market_id,
                        "outcome": outcome,
                        "price": entry_price,
                        "size": size,
                        "partial": partial,
                    }),
                );
            }
            ReconcileEvent::RoundTrip { matched, profit } => {
                self.realized_profit += profit;
                self.activity.info(
                    "round_trip",
                    format!("merged {matched} pairs for {profit} profit"),
                    json!({"market_id": market_id, "matched": matched, "profit": profit}),
                );
                match self.settlement.merge(market_id, neg_risk, matched).await {
                    Ok(outcome) if outcome.success => {
                        info!(market = market_id, tx = ?outcome.tx_hash, "merge confirmed");
                    }
                    Ok(outcome) => {
                        warn!(market = market_id, error = ?outcome.error, "merge failed");
                    }
                    Err(e) => {
                        warn!(market = market_id, "merge errored: {e}");
                    }
                }
            }
            ReconcileEvent::ExitPlaced {
                outcome,
                price,
                size,
            } => {
                self.activity.warn(
                    "timeout_exit",
                    format!("selling {size} {outcome} @ {price} after one-sided timeout"),
                    json!({"market_id": market_id, "outcome": outcome, "price": price, "size": size}),
                );
            }
            ReconcileEvent::HoldingToExpiry {
                outcome,
                loss_per_share,
            } => {
                debug!(
                    market = market_id,
                    outcome = %outcome,
                    loss = %loss_per_share,
                    "holding one-sided fill to expiry"
                );
            }
        }
    }

    /// Refresh per-asset realized vol for the fair-value model.
    pub async fn refresh_realized_vol(&mut self) {
        for asset in self.config.assets.clone() {
            match self
                .candles
                .recent_candles(asset, self.config.mode.candle_interval(), 60)
                .await
            {
                Ok(candles) => {
                    let sigma = realized_vol_garman_klass(&candles);
                    self.realized_sigma.insert(asset, sigma);
                }
                Err(e) => {
                    debug!(asset = %asset, "realized vol refresh failed: {e}");
                }
            }
        }
    }

    pub async fn requote_all(&mut self) {
        let ids: Vec<String> = self.markets.keys().cloned().collect();
        for id in ids {
            self.maybe_quote(&id).await;
        }
    }

    // ------------------------------------------------------------------
    // Quoting
    // ------------------------------------------------------------------

    /// One quote attempt for one market; most exits are silent declines.
    pub async fn maybe_quote(&mut self, market_id: &str) {
        let now = Utc::now();
        if self.breaker.is_halted(now) {
            return;
        }

        let pull_lead = chrono::Duration::from_std(self.config.pre_expiry_pull)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let refresh = chrono::Duration::from_std(self.config.quote_refresh)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));

        // Snapshot everything the quote needs, then drop the borrow
        // before the first await.
        let snapshot = match self.markets.get(market_id) {
            Some(m) => {
                // A filled side means we wait for the round trip or the
                // timeout exit, never requote.
                if m.has_any_fill() || m.exit_order.is_some() {
                    return;
                }
                if now >= m.end_time - pull_lead {
                    return;
                }
                // One outstanding quote-and-settle attempt per market.
                if let Some(last) = m.last_quote_time {
                    if now - last < refresh {
                        return;
                    }
                }
                (
                    m.asset,
                    m.yes_token_id.clone(),
                    m.no_token_id.clone(),
                    m.neg_risk,
                    m.midpoint,
                    m.strike,
                    m.yes_held,
                    m.no_held,
                    m.minutes_remaining(now),
                )
            }
            None => return,
        };
        let (asset, yes_token, no_token, neg_risk, midpoint, strike, yes_held, no_held, minutes) =
            snapshot;

        let meta = self.metadata.get(&yes_token, neg_risk).await;
        let balance = match self.balance.collateral().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(market = market_id, "balance query failed, skipping tick: {e}");
                return;
            }
        };

        let inputs = QuoteInputs {
            midpoint,
            regime: self.classifier.regime(),
            base_spread_cents: Decimal::from(self.config.base_spread_cents),
            max_position_size: self.config.max_position_size,
            yes_held,
            no_held,
            balance,
            tick_size: meta.tick_size,
        };
        let mut pair = quote_for(&inputs);
        if self.config.fair_value_enabled {
            if let Some(quoted) = pair.take() {
                pair = self.bias_toward_fair_value(
                    &quoted,
                    asset,
                    strike,
                    midpoint,
                    minutes,
                    meta.tick_size,
                    now,
                );
            }
        }

        let Some(pair) = pair else {
            // Declined. If anything is still resting it no longer
            // reflects what we are willing to trade.
            self.pull_quotes(market_id, "quote declined").await;
            return;
        };

        if !self.requote_needed(market_id, &pair, meta.tick_size) {
            return;
        }
        if self.would_breach_exposure(market_id, &pair) {
            debug!(market = market_id, "skipping quote, exposure cap reached");
            return;
        }

        // Mark the attempt before any network call so a slow cancel or
        // placement cannot let a second attempt through.
        if let Some(market) = self.markets.get_mut(market_id) {
            market.last_quote_time = Some(now);
        }

        // Cancel-before-replace.
        self.pull_quotes(market_id, "replacing").await;

        // Placement changes available balance.
        self.balance.invalidate().await;

        let bid_order = self
            .place_side(market_id, &yes_token, Outcome::Yes, pair.bid, pair.size, now)
            .await;
        let ask_order = self
            .place_side(market_id, &no_token, Outcome::No, pair.ask, pair.size, now)
            .await;

        if let Some(market) = self.markets.get_mut(market_id) {
            market.resting_bid = bid_order;
            market.resting_ask = ask_order;
        }
    }

    /// Fair-value post-processing: compute the model edge off fresh spot
    /// and shift the pair toward it, re-checking the quote invariants.
    #[allow(clippy::too_many_arguments)]
    fn bias_toward_fair_value(
        &self,
        pair: &QuotePair,
        asset: CryptoAsset,
        strike: Option<Decimal>,
        midpoint: Option<Decimal>,
        minutes_left: f64,
        tick_size: Decimal,
        now: DateTime<Utc>,
    ) -> Option<QuotePair> {
        let (Some(strike), Some(midpoint)) = (strike, midpoint) else {
            // No strike or no book: nothing to bias against, keep the
            // regime/skew quote.
            return Some(pair.clone());
        };
        let Some(tick) = self.spot_cache.latest(asset, now) else {
            return Some(pair.clone());
        };

        let spot = tick.price.to_f64().unwrap_or(0.0);
        let strike_f = strike.to_f64().unwrap_or(0.0);
        let market_yes = midpoint.to_f64().unwrap_or(0.0);
        let sigma = self
            .realized_sigma
            .get(&asset)
            .copied()
            .unwrap_or_else(|| realized_vol_garman_klass(&[]));

        let result = analyze_mispricing(
            spot,
            strike_f,
            sigma,
            minutes_left,
            market_yes,
            self.config.min_edge_cents as f64,
        );
        if !result.edge.is_finite() {
            warn!(asset = %asset, "non-finite model edge, skipping bias");
            return Some(pair.clone());
        }
        let Some(edge) = Decimal::from_f64(result.edge) else {
            return Some(pair.clone());
        };

        debug!(
            asset = %asset,
            fair = result.fair_yes,
            market = market_yes,
            edge = result.edge,
            confidence = result.confidence,
            "fair-value bias"
        );
        apply_fair_value_bias(pair, edge, tick_size)
    }

    /// Replace only on materially new prices: any side off by a full
    /// tick, or a size change.
    fn requote_needed(&self, market_id: &str, pair: &QuotePair, tick_size: Decimal) -> bool {
        let Some(market) = self.markets.get(market_id) else {
            return false;
        };
        let (Some(bid), Some(ask)) = (&market.resting_bid, &market.resting_ask) else {
            return true;
        };
        (pair.bid - bid.price).abs() >= tick_size
            || (pair.ask - ask.price).abs() >= tick_size
            || pair.size != bid.size
            || pair.size != ask.size
    }

    /// Aggregate exposure: notional of everything resting plus held
    /// inventory, across all markets except the one being requoted.
    fn would_breach_exposure(&self, market_id: &str, pair: &QuotePair) -> bool {
        let mut exposure = Decimal::ZERO;
        for market in self.markets.values() {
            if market.market_id == market_id {
                continue;
            }
            if let Some(order) = &market.resting_bid {
                exposure += order.price * order.size;
            }
            if let Some(order) = &market.resting_ask {
                exposure += order.price * order.size;
            }
            exposure += market.yes_held + market.no_held;
        }
        let new_notional = (pair.bid + pair.ask) * pair.size;
        exposure + new_notional > self.config.max_total_exposure
    }

    async fn place_side(
        &self,
        market_id: &str,
        token_id: &str,
        outcome: Outcome,
        price: Decimal,
        size: Decimal,
        now: DateTime<Utc>,
    ) -> Option<RestingOrder> {
        let order = PlaceOrder {
            token_id: token_id.to_string(),
            side: Side::Buy,
            price,
            size,
            post_only: true,
        };
        match self.router.place_order(&order).await {
            Ok(placed) => {
                debug!(
                    market = market_id,
                    outcome = %outcome,
                    price = %price,
                    size = %size,
                    order = %placed.order_id,
                    "quote placed"
                );
                Some(RestingOrder {
                    order_id: placed.order_id,
                    price,
                    size,
                    placed_at: now,
                })
            }
            Err(e) => {
                warn!(market = market_id, outcome = %outcome, "placement failed: {e}");
                None
            }
        }
    }

    /// Best-effort cancel of one market's resting orders.
    async fn pull_quotes(&mut self, market_id: &str, reason: &str) {
        let orders = match self.markets.get_mut(market_id) {
            Some(market) => {
                let mut orders = Vec::new();
                if let Some(order) = market.resting_bid.take() {
                    orders.push(order);
                }
                if let Some(order) = market.resting_ask.take() {
                    orders.push(order);
                }
                orders
            }
            None => return,
        };
        if orders.is_empty() {
            return;
        }
        debug!(market = market_id, reason, "pulling quotes");
        for order in orders {
            if let Err(e) = self.router.cancel_order(&order.order_id).await {
                warn!(order = %order.order_id, "cancel failed ({reason}): {e}");
            }
        }
    }

    async fn cancel_all_quotes(&mut self, reason: &str) {
        let ids: Vec<String> = self.markets.keys().cloned().collect();
        for id in ids {
            self.pull_quotes(&id, reason).await;
        }
    }

    /// Point the book stream at the YES instruments of every tracked
    /// market.
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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use mm_common::{Candle, SpotTick, WindowMode};
    use mm_market::{CandleError, CatalogMarket, CatalogQuery, FinderError};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    use crate::router::{BalanceKind, OpenOrder, PlacedOrder, RouterError};
    use crate::settlement::{ChainClient, SettlementError, TxOutcome};

    #[derive(Default)]
    struct MockRouter {
        placed: Mutex<Vec<PlaceOrder>>,
        cancelled: Mutex<Vec<String>>,
        next_id: Mutex<u32>,
    }

    #[async_trait]
    impl OrderRouter for MockRouter {
        async fn place_order(&self, order: &PlaceOrder) -> Result<PlacedOrder, RouterError> {
            self.placed.lock().unwrap().push(order.clone());
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            Ok(PlacedOrder {
                order_id: format!("order-{}", *id),
            })
        }
        async fn cancel_order(&self, order_id: &str) -> Result<(), RouterError> {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
        async fn cancel_all(&self, _market_id: &str) -> Result<(), RouterError> {
            Ok(())
        }
        async fn open_orders(&self) -> Result<Vec<OpenOrder>, RouterError> {
            Ok(Vec::new())
        }
        async fn balance(&self, _kind: &BalanceKind) -> Result<Decimal, RouterError> {
            Ok(dec!(1000))
        }
    }

    struct MockCatalog {
        markets: Vec<CatalogMarket>,
    }

    #[async_trait]
    impl MarketCatalog for MockCatalog {
        async fn list_markets(
            &self,
            _query: &CatalogQuery,
        ) -> Result<Vec<CatalogMarket>, FinderError> {
            Ok(self.markets.clone())
        }
    }

    struct NoHistory;

    #[async_trait]
    impl HistoricalSpot for NoHistory {
        async fn price_at(&self, _asset: CryptoAsset, _at: DateTime<Utc>) -> Option<Decimal> {
            None
        }
    }

    struct NoCandles;

    #[async_trait]
    impl CandleSource for NoCandles {
        async fn recent_candles(
            &self,
            _asset: CryptoAsset,
            _interval: &str,
            _limit: u32,
        ) -> Result<Vec<Candle>, CandleError> {
            Err(CandleError::InvalidData("unavailable".to_string()))
        }
    }

    struct NoSpot;

    #[async_trait]
    impl SpotQuote for NoSpot {
        async fn latest_price(&self, _asset: CryptoAsset) -> Option<Decimal> {
            None
        }
    }

    struct MockChain;

    #[async_trait]
    impl ChainClient for MockChain {
        async fn is_resolved(&self, _condition_id: &str) -> Result<bool, SettlementError> {
            Ok(false)
        }
        async fn redeem(
            &self,
            _condition_id: &str,
            _neg_risk: bool,
            _amount: Decimal,
        ) -> Result<TxOutcome, SettlementError> {
            Ok(TxOutcome {
                success: true,
                tx_hash: Some("0x1".to_string()),
                error: None,
            })
        }
        async fn merge(
            &self,
            _condition_id: &str,
            _neg_risk: bool,
            _amount: Decimal,
        ) -> Result<TxOutcome, SettlementError> {
            Ok(TxOutcome {
                success: true,
                tx_hash: Some("0x2".to_string()),
                error: None,
            })
        }
    }

    fn catalog_market(id: &str, minutes_out: i64, now: DateTime<Utc>) -> CatalogMarket {
        // The window text only needs the right width; the absolute end
        // comes from end_date.
        CatalogMarket {
            id: id.to_string(),
            question: "Bitcoin Up or Down - 3:45pm-4:00pm ET".to_string(),
            yes_token_id: Some(format!("{id}-yes")),
            no_token_id: Some(format!("{id}-no")),
            end_date: Some(now + ChronoDuration::minutes(minutes_out)),
            active: true,
            closed: false,
            neg_risk: false,
        }
    }

    fn test_engine(
        router: Arc<MockRouter>,
        catalog_markets: Vec<CatalogMarket>,
    ) -> (MmEngine, Arc<SpotCache>) {
        let mut config = EngineConfig::preset_15m();
        config.assets = vec![CryptoAsset::Btc];
        config.endpoints.clob_rest = "http://127.0.0.1:1".to_string();

        let metadata = Arc::new(MetadataCache::new(
            "http://127.0.0.1:1",
            Duration::from_millis(50),
        ));
        let spot_cache = Arc::new(SpotCache::new());
        let (_book_tx, book_rx) = mpsc::channel(16);
        let (_spot_tx, spot_rx) = mpsc::channel(16);

        let deps = MmEngineDeps {
            router: router as Arc<dyn OrderRouter>,
            catalog: Arc::new(MockCatalog {
                markets: catalog_markets,
            }),
            history: Arc::new(NoHistory),
            candles: Arc::new(NoCandles),
            spot_quote: Arc::new(NoSpot),
            metadata,
            settlement: SettlementManager::new(Arc::new(MockChain)),
            activity: Arc::new(ActivityLog::new(100)),
            spot_cache: Arc::clone(&spot_cache),
            book_events: book_rx,
            spot_events: spot_rx,
            book_handle: None,
            spot_handle: None,
        };
        (MmEngine::new(config, deps), spot_cache)
    }

    fn seed_market(engine: &mut MmEngine, id: &str, minutes_out: i64) {
        let now = Utc::now();
        let end = now + ChronoDuration::minutes(minutes_out);
        let found = mm_market::FoundMarket {
            market_id: id.to_string(),
            question: "Bitcoin Up or Down".to_string(),
            asset: CryptoAsset::Btc,
            yes_token_id: format!("{id}-yes"),
            no_token_id: format!("{id}-no"),
            end_time: end,
            strike: Some(dec!(97500)),
            neg_risk: false,
            window: mm_market::SessionWindow {
                start: end - ChronoDuration::minutes(WindowMode::FifteenMin.minutes()),
                end,
            },
        };
        engine
            .markets
            .insert(id.to_string(), ActiveMarket::from_found(&found));
    }

    #[tokio::test]
    async fn test_book_update_places_two_sided_quote() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        engine
            .handle_book_event(BookEvent::Top(TopOfBook {
                token_id: "m1-yes".to_string(),
                best_bid: dec!(0.50),
                best_bid_size: dec!(100),
                best_ask: dec!(0.54),
                best_ask_size: dec!(100),
                timestamp: Utc::now(),
            }))
            .await;

        let placed = router.placed.lock().unwrap().clone();
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|o| o.post_only));
        assert!(placed.iter().all(|o| o.side == Side::Buy));
        let market = engine.market("m1").unwrap();
        assert!(market.resting_bid.is_some());
        assert!(market.resting_ask.is_some());
        assert!(market.last_quote_time.is_some());
    }

    #[tokio::test]
    async fn test_volatile_regime_pulls_existing_quotes() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.maybe_quote("m1").await;
        assert!(engine.market("m1").unwrap().has_resting_orders());

        // Next tick in a volatile regime declines and pulls.
        engine.classifier.force_regime(Regime::Volatile);
        if let Some(m) = engine.markets.get_mut("m1") {
            m.last_quote_time = None;
        }
        engine.maybe_quote("m1").await;

        assert!(!engine.market("m1").unwrap().has_resting_orders());
        assert_eq!(router.cancelled.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_requote_while_side_filled() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
            m.bid_fill = Some(crate::market::FillRecord {
                filled_at: Utc::now(),
                entry_price: dec!(0.505),
            });
        }
        engine.maybe_quote("m1").await;
        assert!(router.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_quote_inside_pre_expiry_lead() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        // 15m preset pulls quotes 120s before expiry.
        seed_market(&mut engine, "m1", 1);
        engine.classifier.force_regime(Regime::Calm);

        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.maybe_quote("m1").await;
        assert!(router.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_materially_same_quote_is_not_replaced() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.maybe_quote("m1").await;
        assert_eq!(router.placed.lock().unwrap().len(), 2);

        // Same book, past the refresh window: prices unchanged, so no
        // cancel/replace cycle.
        if let Some(m) = engine.markets.get_mut("m1") {
            m.last_quote_time = Some(Utc::now() - ChronoDuration::seconds(10));
        }
        engine.maybe_quote("m1").await;
        assert_eq!(router.placed.lock().unwrap().len(), 2);
        assert!(router.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_book_disconnect_pulls_quotes_and_clears_book() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.maybe_quote("m1").await;
        assert!(engine.market("m1").unwrap().has_resting_orders());

        engine.handle_book_event(BookEvent::Disconnected).await;

        let market = engine.market("m1").unwrap();
        assert!(!market.has_resting_orders());
        assert!(market.midpoint.is_none());
    }

    #[tokio::test]
    async fn test_spot_tick_trips_breaker_and_halts() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", 14);
        engine.classifier.force_regime(Regime::Calm);

        let t0 = Utc::now();
        engine
            .handle_spot_event(SpotEvent::Tick(SpotTick {
                asset: CryptoAsset::Btc,
                price: dec!(100000),
                timestamp: t0,
            }))
            .await;
        engine
            .handle_spot_event(SpotEvent::Tick(SpotTick {
                asset: CryptoAsset::Btc,
                price: dec!(101000),
                timestamp: t0 + ChronoDuration::seconds(30),
            }))
            .await;

        assert_eq!(engine.classifier.regime(), Regime::Volatile);

        // Quoting is halted even if the regime were benign.
        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.classifier.force_regime(Regime::Calm);
        engine.maybe_quote("m1").await;
        assert!(router.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_sweep_queues_redeem_for_inventory() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", -1);
        if let Some(m) = engine.markets.get_mut("m1") {
            m.yes_held = dec!(50);
        }

        engine.sweep_expiry(Utc::now()).await;

        assert_eq!(engine.market_count(), 0);
        assert_eq!(engine.settlement.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_expiry_sweep_drops_flat_market_silently() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        seed_market(&mut engine, "m1", -1);

        engine.sweep_expiry(Utc::now()).await;

        assert_eq!(engine.market_count(), 0);
        assert_eq!(engine.settlement.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_markets_tracks_one_per_asset() {
        let now = Utc::now();
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(
            Arc::clone(&router),
            vec![
                catalog_market("m1", 14, now),
                catalog_market("m2", 29, now),
            ],
        );

        engine.refresh_markets().await;

        // Finder keeps the soonest per asset; second BTC market waits.
        assert_eq!(engine.market_count(), 1);
        assert!(engine.market("m1").is_some());
    }

    #[tokio::test]
    async fn test_exposure_cap_blocks_new_quotes() {
        let router = Arc::new(MockRouter::default());
        let (mut engine, _) = test_engine(Arc::clone(&router), Vec::new());
        engine.config.max_total_exposure = dec!(10);
        seed_market(&mut engine, "m1", 14);
        seed_market(&mut engine, "m2", 14);
        engine.classifier.force_regime(Regime::Calm);

        // m2 already carries inventory that eats the whole cap.
        if let Some(m) = engine.markets.get_mut("m2") {
            m.yes_held = dec!(10);
        }
        if let Some(m) = engine.markets.get_mut("m1") {
            m.update_book(dec!(0.50), dec!(0.54));
        }
        engine.maybe_quote("m1").await;
        assert!(router.placed.lock().unwrap().is_empty());
    }
}
