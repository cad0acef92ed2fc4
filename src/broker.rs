//! Paper account: reference resolver and risk source.
//!
//! Positions are marked to the latest `price` observation. An agent's reward
//! for a decision is the change in its book value (realized + unrealized)
//! since its previous decision, net of the fee on anything it opens now.

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::agent::{Action, AgentId, Outcome};
use crate::controller::ActionResolver;
use crate::fingerprint::Context;
use crate::guardian::{AccountGateway, GuardianSnapshot, RiskState, TrendRiskPredictor};
use crate::logging::{self, Domain, Level};
use crate::signals::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: u64,
    pub agent_id: AgentId,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
}

impl Position {
    pub fn pnl(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - price) * self.size,
        }
    }

    /// Loss as a fraction of entry notional; positive when losing.
    pub fn loss_ratio(&self, price: f64) -> f64 {
        let notional = self.entry_price * self.size;
        if notional <= 0.0 {
            0.0
        } else {
            -self.pnl(price) / notional
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub initial_capital: f64,
    pub fee_rate: f64,
    /// Margin reserved per unit of notional.
    pub margin_rate: f64,
    /// Runaway when at least this many positions are open...
    pub runaway_min_positions: usize,
    /// ...and every one of them is losing more than this fraction.
    pub runaway_loss: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            fee_rate: 0.0005,
            margin_rate: 0.1,
            runaway_min_positions: 3,
            runaway_loss: 0.01,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    price: Option<f64>,
    positions: Vec<Position>,
    next_position: u64,
    realized: f64,
    realized_by_agent: HashMap<AgentId, f64>,
    last_value: HashMap<AgentId, f64>,
    peak_equity: f64,
    closed_total: u64,
}

impl Book {
    fn equity(&self, capital: f64) -> f64 {
        let price = self.price.unwrap_or(0.0);
        capital + self.realized + self.positions.iter().map(|p| p.pnl(price)).sum::<f64>()
    }

    fn agent_value(&self, agent_id: &str) -> f64 {
        let price = self.price.unwrap_or(0.0);
        let realized = self.realized_by_agent.get(agent_id).copied().unwrap_or(0.0);
        realized
            + self
                .positions
                .iter()
                .filter(|p| p.agent_id == agent_id)
                .map(|p| p.pnl(price))
                .sum::<f64>()
    }

    fn close_at(&mut self, idx: usize, fee_rate: f64) {
        let price = self.price.unwrap_or(0.0);
        let p = self.positions.remove(idx);
        let pnl = p.pnl(price) - p.size * price * fee_rate;
        self.realized += pnl;
        *self.realized_by_agent.entry(p.agent_id).or_insert(0.0) += pnl;
        self.closed_total += 1;
    }

    /// Indices sorted worst unrealized PnL first.
    fn worst_first(&self) -> Vec<usize> {
        let price = self.price.unwrap_or(0.0);
        let mut idx: Vec<usize> = (0..self.positions.len()).collect();
        idx.sort_by(|a, b| {
            self.positions[*a]
                .pnl(price)
                .partial_cmp(&self.positions[*b].pnl(price))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx
    }

    fn close_indices(&mut self, mut indices: Vec<usize>, fee_rate: f64) -> usize {
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();
        for idx in &indices {
            self.close_at(*idx, fee_rate);
        }
        indices.len()
    }

    fn clusters(&self) -> HashMap<(AgentId, Side), Vec<usize>> {
        let mut out: HashMap<(AgentId, Side), Vec<usize>> = HashMap::new();
        for (i, p) in self.positions.iter().enumerate() {
            out.entry((p.agent_id.clone(), p.side)).or_default().push(i);
        }
        out
    }
}

pub struct PaperBroker {
    cfg: BrokerConfig,
    book: Mutex<Book>,
}

impl PaperBroker {
    pub fn new(cfg: BrokerConfig) -> Self {
        let book = Book {
            peak_equity: cfg.initial_capital,
            ..Book::default()
        };
        Self {
            cfg,
            book: Mutex::new(book),
        }
    }

    pub fn mark(&self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let mut book = self.book.lock();
        book.price = Some(price);
        let equity = book.equity(self.cfg.initial_capital);
        if equity > book.peak_equity {
            book.peak_equity = equity;
        }
    }

    pub fn open_positions(&self) -> usize {
        self.book.lock().positions.len()
    }

    pub fn equity(&self) -> f64 {
        self.book.lock().equity(self.cfg.initial_capital)
    }

    pub fn closed_total(&self) -> u64 {
        self.book.lock().closed_total
    }

    fn state(&self) -> RiskState {
        let book = self.book.lock();
        let price = book.price.unwrap_or(0.0);
        let equity = book.equity(self.cfg.initial_capital);
        let used: f64 = book.positions.iter().map(|p| p.size * price * self.cfg.margin_rate).sum();
        let margin_level = if equity > 0.0 { ((equity - used) / equity).max(0.0) } else { 0.0 };
        RiskState {
            equity,
            peak_equity: book.peak_equity.max(equity),
            margin_level,
            open_position_count: book.positions.len(),
            largest_cluster: book.clusters().values().map(Vec::len).max().unwrap_or(0),
        }
    }

    fn report(&self, action: &str, closed: usize) {
        logging::log(
            Level::Info,
            Domain::Guardian,
            "broker_correction",
            logging::obj(&[
                ("action", logging::v_str(action)),
                ("closed", serde_json::json!(closed)),
                ("open", serde_json::json!(self.open_positions())),
            ]),
        );
    }
}

#[async_trait]
impl ActionResolver for PaperBroker {
    fn on_observation(&self, observation: &Observation) {
        if let Some(price) = observation.get("price") {
            self.mark(*price);
        }
    }

    async fn resolve(&self, agent_id: &str, context: &Context, action: Action) -> AnyResult<Outcome> {
        let mut book = self.book.lock();
        let price = book.price.ok_or_else(|| anyhow!("no price marked yet"))?;

        let value = book.agent_value(agent_id);
        let previous = book.last_value.get(agent_id).copied().unwrap_or(value);
        let mut reward = value - previous;

        match action {
            Action::Hold => {}
            Action::Buy { size } | Action::Sell { size } if size > 0.0 && size.is_finite() => {
                let side = if matches!(action, Action::Buy { .. }) { Side::Long } else { Side::Short };
                book.next_position += 1;
                let id = book.next_position;
                book.positions.push(Position {
                    id,
                    agent_id: agent_id.to_string(),
                    side,
                    size,
                    entry_price: price,
                });
                let fee = size * price * self.cfg.fee_rate;
                book.realized -= fee;
                *book.realized_by_agent.entry(agent_id.to_string()).or_insert(0.0) -= fee;
                reward -= fee;
            }
            Action::Buy { .. } | Action::Sell { .. } => return Err(anyhow!("invalid order size")),
            Action::Close => {
                let mine: Vec<usize> = (0..book.positions.len())
                    .filter(|i| book.positions[*i].agent_id == agent_id)
                    .collect();
                book.close_indices(mine, self.cfg.fee_rate);
            }
        }

        // Realization moves value between buckets; fees already counted.
        let after = book.agent_value(agent_id);
        book.last_value.insert(agent_id.to_string(), after);

        Ok(Outcome {
            agent_id: agent_id.to_string(),
            context: context.clone(),
            action: Some(action),
            reward,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl AccountGateway for PaperBroker {
    async fn risk_state(&self) -> AnyResult<RiskState> {
        Ok(self.state())
    }

    async fn reduce_exposure(&self, fraction: f64) -> AnyResult<usize> {
        let closed = {
            let mut book = self.book.lock();
            let n = ((book.positions.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
            let worst: Vec<usize> = book.worst_first().into_iter().take(n).collect();
            book.close_indices(worst, self.cfg.fee_rate)
        };
        self.report("reduce_exposure", closed);
        Ok(closed)
    }

    async fn limit_open_trades(&self, max: usize) -> AnyResult<usize> {
        let closed = {
            let mut book = self.book.lock();
            let excess = book.positions.len().saturating_sub(max);
            let worst: Vec<usize> = book.worst_first().into_iter().take(excess).collect();
            book.close_indices(worst, self.cfg.fee_rate)
        };
        self.report("limit_open_trades", closed);
        Ok(closed)
    }

    async fn close_riskiest_positions(&self, keep: usize) -> AnyResult<usize> {
        let closed = {
            let mut book = self.book.lock();
            let price = book.price.unwrap_or(0.0);
            let mut doomed = Vec::new();
            for (_, mut members) in book.clusters() {
                if members.len() <= keep {
                    continue;
                }
                members.sort_by(|a, b| {
                    book.positions[*a]
                        .pnl(price)
                        .partial_cmp(&book.positions[*b].pnl(price))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let excess = members.len() - keep;
                doomed.extend(members.into_iter().take(excess));
            }
            book.close_indices(doomed, self.cfg.fee_rate)
        };
        self.report("close_riskiest_positions", closed);
        Ok(closed)
    }

    async fn emergency_stop(&self) -> AnyResult<usize> {
        let closed = {
            let mut book = self.book.lock();
            let all: Vec<usize> = (0..book.positions.len()).collect();
            book.close_indices(all, self.cfg.fee_rate)
        };
        self.report("emergency_stop", closed);
        Ok(closed)
    }
}

impl TrendRiskPredictor for PaperBroker {
    fn runaway_risk(&self, _snapshot: &GuardianSnapshot) -> bool {
        let book = self.book.lock();
        let Some(price) = book.price else {
            return false;
        };
        book.positions.len() >= self.cfg.runaway_min_positions
            && book
                .positions
                .iter()
                .all(|p| p.loss_ratio(price) > self.cfg.runaway_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> PaperBroker {
        let b = PaperBroker::new(BrokerConfig {
            fee_rate: 0.0,
            ..BrokerConfig::default()
        });
        b.mark(100.0);
        b
    }

    #[tokio::test]
    async fn test_reward_tracks_book_value() {
        let b = broker();
        let ctx = Context::empty();
        let first = b.resolve("a", &ctx, Action::Buy { size: 2.0 }).await.unwrap();
        assert_eq!(first.reward, 0.0);
        b.mark(105.0);
        let second = b.resolve("a", &ctx, Action::Close).await.unwrap();
        assert!((second.reward - 10.0).abs() < 1e-9);
        assert_eq!(b.open_positions(), 0);
        let third = b.resolve("a", &ctx, Action::Hold).await.unwrap();
        assert_eq!(third.reward, 0.0);
        assert!((b.equity() - 10_010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_resolve_without_price_fails() {
        let b = PaperBroker::new(BrokerConfig::default());
        assert!(b.resolve("a", &Context::empty(), Action::Hold).await.is_err());
    }

    #[tokio::test]
    async fn test_limit_open_trades_closes_worst() {
        let b = broker();
        let ctx = Context::empty();
        for _ in 0..4 {
            b.resolve("a", &ctx, Action::Buy { size: 1.0 }).await.unwrap();
        }
        b.resolve("b", &ctx, Action::Sell { size: 1.0 }).await.unwrap();
        b.mark(110.0);
        let closed = b.limit_open_trades(2).await.unwrap();
        assert_eq!(closed, 3);
        assert_eq!(b.open_positions(), 2);
        // the short was the only loser and goes first
        let state = b.risk_state().await.unwrap();
        assert_eq!(state.largest_cluster, 2);
    }

    #[tokio::test]
    async fn test_grid_cluster_trimmed_to_keep() {
        let b = broker();
        let ctx = Context::empty();
        for _ in 0..9 {
            b.resolve("a", &ctx, Action::Buy { size: 1.0 }).await.unwrap();
        }
        assert_eq!(b.risk_state().await.unwrap().largest_cluster, 9);
        assert_eq!(b.close_riskiest_positions(7).await.unwrap(), 2);
        assert_eq!(b.risk_state().await.unwrap().largest_cluster, 7);
    }

    #[tokio::test]
    async fn test_runaway_when_everything_loses() {
        let b = broker();
        let ctx = Context::empty();
        for _ in 0..3 {
            b.resolve("a", &ctx, Action::Buy { size: 1.0 }).await.unwrap();
        }
        let snap = GuardianSnapshot::from_state(1, &b.risk_state().await.unwrap());
        assert!(!b.runaway_risk(&snap));
        b.mark(95.0);
        assert!(b.runaway_risk(&snap));
        assert_eq!(b.emergency_stop().await.unwrap(), 3);
        assert!(!b.runaway_risk(&snap));
    }

    #[tokio::test]
    async fn test_drawdown_visible_in_risk_state() {
        let b = broker();
        b.resolve("a", &Context::empty(), Action::Buy { size: 10.0 }).await.unwrap();
        b.mark(120.0);
        b.mark(60.0);
        let state = b.risk_state().await.unwrap();
        let snap = GuardianSnapshot::from_state(1, &state);
        // peak 10_200, now 9_600
        assert!((snap.drawdown - 600.0 / 10_200.0).abs() < 1e-9);
    }
}
