//! Fill detection and reconciliation.
//!
//! Fills are detected by diffing tracked order ids against a fresh
//! open-order snapshot, never trusted from a single source: a partial
//! match and an order that vanished entirely both get confirmed against
//! the held token balance before any inventory is credited. Runs on its
//! own short timer alongside the streaming path; both are idempotent,
//! so double-detection of the same fill is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mm_common::{Outcome, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::balance::BalanceCache;
use crate::market::{ActiveMarket, FillRecord, RestingOrder};
use crate::router::{BalanceKind, OpenOrder, OrderRouter, PlaceOrder};

/// Worst acceptable loss per share when closing a timed-out one-sided
/// fill at the bid. Beyond this the position is held to expiry.
const MAX_EXIT_LOSS_PER_SHARE: Decimal = dec!(0.10);

/// Taker fee applied to the exit proceeds.
const TAKER_FEE_RATE: Decimal = dec!(0.02);

/// What a reconciliation pass observed for one market.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    /// Inventory was credited on one side.
    Fill {
        outcome: Outcome,
        entry_price: Decimal,
        size: Decimal,
        partial: bool,
    },
    /// Both legs are held: profit is locked in, merge the pair.
    RoundTrip { matched: Decimal, profit: Decimal },
    /// A one-sided fill timed out and a closing sell was placed.
    ExitPlaced { outcome: Outcome, price: Decimal, size: Decimal },
    /// A one-sided fill timed out but closing would realize too large a
    /// loss; the position rides to expiry.
    HoldingToExpiry { outcome: Outcome, loss_per_share: Decimal },
}

pub struct FillReconciler {
    router: Arc<dyn OrderRouter>,
    balance: Arc<BalanceCache>,
    one_side_timeout: Duration,
}

impl FillReconciler {
    pub fn new(
        router: Arc<dyn OrderRouter>,
        balance: Arc<BalanceCache>,
        one_side_timeout: Duration,
    ) -> Self {
        Self {
            router,
            balance,
            one_side_timeout,
        }
    }

    /// Fetch a fresh open-order snapshot keyed by order id.
    pub async fn snapshot(&self) -> Result<HashMap<String, OpenOrder>, crate::router::RouterError> {
        let orders = self.router.open_orders().await?;
        Ok(orders.into_iter().map(|o| (o.order_id.clone(), o)).collect())
    }

    /// One reconciliation pass over a single market. Mutates fill and
    /// inventory state in place and returns what happened; the caller
    /// reacts to round trips (merge) and keeps its own books.
    pub async fn check_market(
        &self,
        market: &mut ActiveMarket,
        open_orders: &HashMap<String, OpenOrder>,
        now: DateTime<Utc>,
    ) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();

        if market.bid_fill.is_none() {
            if let Some(event) = self
                .check_side(market, Outcome::Yes, open_orders, now)
                .await
            {
                events.push(event);
            }
        }
        if market.ask_fill.is_none() {
            if let Some(event) = self
                .check_side(market, Outcome::No, open_orders, now)
                .await
            {
                events.push(event);
            }
        }

        if let Some(event) = Self::settle_round_trip(market) {
            events.push(event);
        } else if let Some(event) = self.check_one_sided_timeout(market, now).await {
            events.push(event);
        }

        events
    }

    /// Reconcile one side's resting order against the snapshot.
    ///
    /// Still open, nothing matched: leave it. Partially matched: take
    /// the fill, cancel the remainder and the opposite side. Gone from
    /// the snapshot: confirm via balance before crediting, since a
    /// cancelled-and-gone order looks identical to a filled one.
    async fn check_side(
        &self,
        market: &mut ActiveMarket,
        outcome: Outcome,
        open_orders: &HashMap<String, OpenOrder>,
        now: DateTime<Utc>,
    ) -> Option<ReconcileEvent> {
        let resting = match outcome {
            Outcome::Yes => market.resting_bid.clone()?,
            Outcome::No => market.resting_ask.clone()?,
        };
        let token_id = match outcome {
            Outcome::Yes => market.yes_token_id.clone(),
            Outcome::No => market.no_token_id.clone(),
        };

        match open_orders.get(&resting.order_id) {
            Some(open) if open.matched_size > Decimal::ZERO => {
                if let Err(e) = self.router.cancel_order(&resting.order_id).await {
                    warn!(order = %resting.order_id, "failed to cancel partial remainder: {e}");
                }
                let held = self
                    .confirmed_held(&token_id, open.matched_size)
                    .await;
                self.credit_fill(market, outcome, &resting, held, now);
                self.cancel_opposite(market, outcome, open_orders).await;
                Some(ReconcileEvent::Fill {
                    outcome,
                    entry_price: resting.price,
                    size: held,
                    partial: true,
                })
            }
            Some(_) => None,
            None => {
                // Gone from the snapshot. Only the balance says whether
                // it filled or was cancelled out from under us.
                match self.router.balance(&BalanceKind::Token { token_id }).await {
                    Ok(held) if held > Decimal::ZERO => {
                        self.credit_fill(market, outcome, &resting, held, now);
                        self.cancel_opposite(market, outcome, open_orders).await;
                        Some(ReconcileEvent::Fill {
                            outcome,
                            entry_price: resting.price,
                            size: held,
                            partial: false,
                        })
                    }
                    Ok(_) => {
                        debug!(
                            market = %market.market_id,
                            order = %resting.order_id,
                            "order gone with zero balance, treating as cancelled"
                        );
                        match outcome {
                            Outcome::Yes => market.resting_bid = None,
                            Outcome::No => market.resting_ask = None,
                        }
                        None
                    }
                    Err(e) => {
                        // Cannot confirm either way: do not credit
                        // inventory, retry on the next pass.
                        warn!(
                            market = %market.market_id,
                            "balance confirmation failed, deferring fill decision: {e}"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Balance query with the matched-size report as fallback when the
    /// query fails. Over-crediting is the failure mode to avoid, so the
    /// smaller of the two wins when both are available.
    async fn confirmed_held(&self, token_id: &str, reported: Decimal) -> Decimal {
        match self
            .router
            .balance(&BalanceKind::Token {
                token_id: token_id.to_string(),
            })
            .await
        {
            Ok(held) => held.min(reported).max(Decimal::ZERO),
            Err(e) => {
                warn!(token = token_id, "balance confirmation failed, using matched size: {e}");
                reported
            }
        }
    }

    fn credit_fill(
        &self,
        market: &mut ActiveMarket,
        outcome: Outcome,
        resting: &RestingOrder,
        held: Decimal,
        now: DateTime<Utc>,
    ) {
        info!(
            market = %market.market_id,
            outcome = %outcome,
            price = %resting.price,
            size = %held,
            "fill confirmed"
        );
        let record = FillRecord {
            filled_at: now,
            entry_price: resting.price,
        };
        match outcome {
            Outcome::Yes => {
                market.yes_held = held;
                market.bid_fill = Some(record);
                market.resting_bid = None;
            }
            Outcome::No => {
                market.no_held = held;
                market.ask_fill = Some(record);
                market.resting_ask = None;
            }
        }
    }

    /// A fill on one side means the other leg's price is stale; pull it
    /// and wait for the round trip or the timeout instead. An opposite
    /// leg already gone from the snapshot is left tracked, since it may
    /// itself have filled and must be classified by its own side's
    /// check.
    async fn cancel_opposite(
        &self,
        market: &mut ActiveMarket,
        filled: Outcome,
        open_orders: &HashMap<String, OpenOrder>,
    ) {
        let slot = match filled {
            Outcome::Yes => &mut market.resting_ask,
            Outcome::No => &mut market.resting_bid,
        };
        let still_open = slot
            .as_ref()
            .map(|o| open_orders.contains_key(&o.order_id))
            .unwrap_or(false);
        if !still_open {
            return;
        }
        if let Some(order) = slot.take() {
            if let Err(e) = self.router.cancel_order(&order.order_id).await {
                warn!(order = %order.order_id, "failed to cancel opposite side: {e}");
            }
        }
    }

    /// Both legs held: lock in the spread, hand the pair to settlement,
    /// clear the markers so the next pass is a no-op.
    fn settle_round_trip(market: &mut ActiveMarket) -> Option<ReconcileEvent> {
        let (bid_fill, ask_fill) = match (&market.bid_fill, &market.ask_fill) {
            (Some(b), Some(a)) => (b.clone(), a.clone()),
            _ => return None,
        };

        let matched = market.yes_held.min(market.no_held);
        if matched <= Decimal::ZERO {
            return None;
        }
        let profit = (Decimal::ONE - (bid_fill.entry_price + ask_fill.entry_price)) * matched;

        info!(
            market = %market.market_id,
            matched = %matched,
            profit = %profit,
            "round trip complete"
        );
        market.yes_held -= matched;
        market.no_held -= matched;
        market.bid_fill = None;
        market.ask_fill = None;

        Some(ReconcileEvent::RoundTrip { matched, profit })
    }

    /// One side filled alone past the timeout: sell into the bid if the
    /// realized loss stays tolerable, otherwise ride to expiry.
    async fn check_one_sided_timeout(
        &self,
        market: &mut ActiveMarket,
        now: DateTime<Utc>,
    ) -> Option<ReconcileEvent> {
        if market.exit_order.is_some() {
            return None;
        }
        let (outcome, fill, held, token_id) = match (&market.bid_fill, &market.ask_fill) {
            (Some(f), None) => (
                Outcome::Yes,
                f.clone(),
                market.yes_held,
                market.yes_token_id.clone(),
            ),
            (None, Some(f)) => (
                Outcome::No,
                f.clone(),
                market.no_held,
                market.no_token_id.clone(),
            ),
            _ => return None,
        };
        if held <= Decimal::ZERO {
            return None;
        }

        let elapsed = (now - fill.filled_at).num_milliseconds();
        if elapsed < self.one_side_timeout.as_millis() as i64 {
            return None;
        }

        // Exit proceeds come from the bid of the held token. The book
        // tracks the YES instrument; the NO bid mirrors the YES ask.
        let exit_bid = match outcome {
            Outcome::Yes => market.best_bid?,
            Outcome::No => market.best_ask.map(|a| Decimal::ONE - a)?,
        };
        let loss_per_share = fill.entry_price - exit_bid + exit_bid * TAKER_FEE_RATE;

        if loss_per_share > MAX_EXIT_LOSS_PER_SHARE {
            debug!(
                market = %market.market_id,
                loss = %loss_per_share,
                "one-sided exit too expensive, holding to expiry"
            );
            return Some(ReconcileEvent::HoldingToExpiry {
                outcome,
                loss_per_share,
            });
        }

        self.balance.invalidate().await;
        let order = PlaceOrder {
            token_id,
            side: Side::Sell,
            price: exit_bid,
            size: held,
            post_only: false,
        };
        match self.router.place_order(&order).await {
            Ok(placed) => {
                info!(
                    market = %market.market_id,
                    outcome = %outcome,
                    price = %exit_bid,
                    size = %held,
                    "one-sided timeout exit placed"
                );
                market.exit_order = Some(RestingOrder {
                    order_id: placed.order_id,
                    price: exit_bid,
                    size: held,
                    placed_at: now,
                });
                Some(ReconcileEvent::ExitPlaced {
                    outcome,
                    price: exit_bid,
                    size: held,
                })
            }
            Err(e) => {
                warn!(market = %market.market_id, "timeout exit placement failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use mm_market::{FoundMarket, SessionWindow};
    use std::sync::Mutex;

    use crate::router::{PlacedOrder, RouterError};

    #[derive(Default)]
    struct ScriptedRouter {
        balances: Mutex<HashMap<String, Decimal>>,
        cancelled: Mutex<Vec<String>>,
        placed: Mutex<Vec<PlaceOrder>>,
        balance_fails: bool,
    }

    impl ScriptedRouter {
        fn with_balance(token: &str, amount: Decimal) -> Self {
            let router = Self::default();
            router
                .balances
                .lock()
                .unwrap()
                .insert(token.to_string(), amount);
            router
        }
    }

    #[async_trait]
    impl OrderRouter for ScriptedRouter {
        async fn place_order(&self, order: &PlaceOrder) -> Result<PlacedOrder, RouterError> {
            self.placed.lock().unwrap().push(order.clone());
            Ok(PlacedOrder {
                order_id: "exit-1".to_string(),
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
        async fn balance(&self, kind: &BalanceKind) -> Result<Decimal, RouterError> {
            if self.balance_fails {
                return Err(RouterError::Rejected("unavailable".to_string()));
            }
            match kind {
                BalanceKind::Collateral => Ok(dec!(1000)),
                BalanceKind::Token { token_id } => Ok(self
                    .balances
                    .lock()
                    .unwrap()
                    .get(token_id)
                    .copied()
                    .unwrap_or(Decimal::ZERO)),
            }
        }
    }

    fn market_with_orders(now: DateTime<Utc>) -> ActiveMarket {
        let end = now + ChronoDuration::minutes(10);
        let found = FoundMarket {
            market_id: "m1".to_string(),
            question: "q".to_string(),
            asset: mm_common::CryptoAsset::Btc,
            yes_token_id: "yes1".to_string(),
            no_token_id: "no1".to_string(),
            end_time: end,
            strike: None,
            neg_risk: false,
            window: SessionWindow {
                start: end - ChronoDuration::minutes(15),
                end,
            },
        };
        let mut m = ActiveMarket::from_found(&found);
        m.update_book(dec!(0.50), dec!(0.54));
        m.resting_bid = Some(RestingOrder {
            order_id: "bid-1".to_string(),
            price: dec!(0.505),
            size: dec!(50),
            placed_at: now,
        });
        m.resting_ask = Some(RestingOrder {
            order_id: "ask-1".to_string(),
            price: dec!(0.465),
            size: dec!(50),
            placed_at: now,
        });
        m
    }

    fn reconciler(router: Arc<ScriptedRouter>) -> FillReconciler {
        let balance = Arc::new(BalanceCache::new(
            Arc::clone(&router) as Arc<dyn OrderRouter>
        ));
        FillReconciler::new(router, balance, Duration::from_secs(30))
    }

    fn open_order(id: &str, token: &str, matched: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            token_id: token.to_string(),
            price: dec!(0.505),
            original_size: dec!(50),
            matched_size: matched,
        }
    }

    #[tokio::test]
    async fn test_untouched_orders_are_left_alone() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);

        let snapshot: HashMap<_, _> = [
            ("bid-1".to_string(), open_order("bid-1", "yes1", dec!(0))),
            ("ask-1".to_string(), open_order("ask-1", "no1", dec!(0))),
        ]
        .into();

        let events = rec.check_market(&mut market, &snapshot, now).await;
        assert!(events.is_empty());
        assert!(market.has_resting_orders());
        assert!(!market.has_any_fill());
    }

    #[tokio::test]
    async fn test_partial_fill_cancels_remainder_and_opposite() {
        let router = Arc::new(ScriptedRouter::with_balance("yes1", dec!(12)));
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);

        let snapshot: HashMap<_, _> = [
            ("bid-1".to_string(), open_order("bid-1", "yes1", dec!(12))),
            ("ask-1".to_string(), open_order("ask-1", "no1", dec!(0))),
        ]
        .into();

        let events = rec.check_market(&mut market, &snapshot, now).await;
        assert!(matches!(
            events[0],
            ReconcileEvent::Fill {
                outcome: Outcome::Yes,
                partial: true,
                ..
            }
        ));
        assert_eq!(market.yes_held, dec!(12));
        assert!(market.bid_fill.is_some());
        assert!(market.resting_bid.is_none());
        assert!(market.resting_ask.is_none());

        let cancelled = router.cancelled.lock().unwrap().clone();
        assert!(cancelled.contains(&"bid-1".to_string()));
        assert!(cancelled.contains(&"ask-1".to_string()));
    }

    #[tokio::test]
    async fn test_gone_order_with_zero_balance_is_cancelled_not_filled() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_ask = None;

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(events.is_empty());
        assert!(market.bid_fill.is_none());
        assert!(market.resting_bid.is_none());
        assert_eq!(market.yes_held, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_gone_order_with_balance_is_a_full_fill() {
        let router = Arc::new(ScriptedRouter::with_balance("yes1", dec!(50)));
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_ask = None;

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(matches!(
            events[0],
            ReconcileEvent::Fill {
                outcome: Outcome::Yes,
                partial: false,
                ..
            }
        ));
        assert_eq!(market.yes_held, dec!(50));
    }

    #[tokio::test]
    async fn test_unconfirmable_fill_is_deferred() {
        let router = Arc::new(ScriptedRouter {
            balance_fails: true,
            ..Default::default()
        });
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_ask = None;

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(events.is_empty());
        // Resting order stays tracked so the next pass retries.
        assert!(market.resting_bid.is_some());
        assert!(market.bid_fill.is_none());
    }

    #[tokio::test]
    async fn test_both_sides_gone_resolves_as_round_trip_in_one_pass() {
        let router = Arc::new(ScriptedRouter::with_balance("yes1", dec!(50)));
        router
            .balances
            .lock()
            .unwrap()
            .insert("no1".to_string(), dec!(50));
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[2],
            ReconcileEvent::RoundTrip { matched, .. } if matched == dec!(50)
        ));
        assert_eq!(market.yes_held, Decimal::ZERO);
        assert_eq!(market.no_held, Decimal::ZERO);
        assert!(!market.has_any_fill());
    }

    #[tokio::test]
    async fn test_round_trip_records_profit_and_clears_markers() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_bid = None;
        market.resting_ask = None;
        market.yes_held = dec!(50);
        market.no_held = dec!(50);
        market.bid_fill = Some(FillRecord {
            filled_at: now,
            entry_price: dec!(0.505),
        });
        market.ask_fill = Some(FillRecord {
            filled_at: now,
            entry_price: dec!(0.465),
        });

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        match &events[0] {
            ReconcileEvent::RoundTrip { matched, profit } => {
                assert_eq!(*matched, dec!(50));
                // (1 - 0.97) * 50
                assert_eq!(*profit, dec!(1.50));
            }
            other => panic!("expected round trip, got {other:?}"),
        }
        assert!(!market.has_any_fill());
        assert_eq!(market.yes_held, Decimal::ZERO);

        // Idempotent: the same snapshot again produces nothing.
        let again = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_exit_within_loss_bound() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_bid = None;
        market.resting_ask = None;
        market.yes_held = dec!(50);
        market.bid_fill = Some(FillRecord {
            filled_at: now - ChronoDuration::seconds(31),
            entry_price: dec!(0.49),
        });
        market.update_book(dec!(0.40), dec!(0.44));

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        // Loss 0.49 - 0.40 + 0.40 * 0.02 = 0.098, inside the bound.
        assert!(matches!(events[0], ReconcileEvent::ExitPlaced { .. }));
        assert!(market.exit_order.is_some());

        let placed = router.placed.lock().unwrap().clone();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].price, dec!(0.40));
        assert!(!placed[0].post_only);

        // No second exit while one is live.
        let again = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_exit_holds_on_large_loss() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_bid = None;
        market.resting_ask = None;
        market.yes_held = dec!(50);
        market.bid_fill = Some(FillRecord {
            filled_at: now - ChronoDuration::seconds(31),
            entry_price: dec!(0.49),
        });
        market.update_book(dec!(0.30), dec!(0.34));

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(matches!(events[0], ReconcileEvent::HoldingToExpiry { .. }));
        assert!(market.exit_order.is_none());
        assert!(router.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_exit_before_timeout() {
        let router = Arc::new(ScriptedRouter::default());
        let rec = reconciler(Arc::clone(&router));
        let now = Utc::now();
        let mut market = market_with_orders(now);
        market.resting_bid = None;
        market.resting_ask = None;
        market.yes_held = dec!(50);
        market.bid_fill = Some(FillRecord {
            filled_at: now - ChronoDuration::seconds(5),
            entry_price: dec!(0.49),
        });

        let events = rec.check_market(&mut market, &HashMap::new(), now).await;
        assert!(events.is_empty());
    }
}
