//! In-memory market transports.

use crate::transport::{MarketConnection, MarketTransport, TransportError};
use async_trait::async_trait;
use keel_domain::MarketEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Random-walk price feed used by paper mode.
#[derive(Debug, Clone)]
pub struct PaperTransport {
    tick_interval: Duration,
    initial_prices: HashMap<String, Decimal>,
    default_price: Decimal,
}

impl PaperTransport {
    /// Creates a new PaperTransport emitting one update per symbol every `tick_interval`.
    #[must_use]
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            initial_prices: HashMap::new(),
            default_price: Decimal::ONE_HUNDRED,
        }
    }

    #[must_use]
    pub fn with_price(mut self, symbol: impl Into<String>, price: Decimal) -> Self {
        self.initial_prices.insert(symbol.into(), price);
        self
    }
}

#[async_trait]
impl MarketTransport for PaperTransport {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn MarketConnection>, TransportError> {
        if symbols.is_empty() {
            return Err(TransportError::Disconnected("empty subscription".to_string()));
        }
        let prices = symbols
            .iter()
            .map(|s| {
                self.initial_prices
                    .get(s)
                    .copied()
                    .unwrap_or(self.default_price)
            })
            .collect();
        Ok(Box::new(PaperConnection {
            symbols: symbols.to_vec(),
            prices,
            sequences: vec![0; symbols.len()],
            cursor: 0,
            step: self.tick_interval / symbols.len() as u32,
            rng: StdRng::from_os_rng(),
        }))
    }
}

struct PaperConnection {
    symbols: Vec<String>,
    prices: Vec<Decimal>,
    sequences: Vec<u64>,
    cursor: usize,
    step: Duration,
    rng: StdRng,
}

#[async_trait]
impl MarketConnection for PaperConnection {
    async fn next_message(&mut self) -> Result<MarketEvent, TransportError> {
        tokio::time::sleep(self.step).await;

        let i = self.cursor;
        self.cursor = (self.cursor + 1) % self.symbols.len();

        // Moves of up to 10 bps either way.
        let bps: i64 = self.rng.random_range(-10..=10);
        let price = (self.prices[i] * (Decimal::ONE + Decimal::new(bps, 4))).round_dp(8);
        self.prices[i] = price;
        self.sequences[i] += 1;

        let mut event = MarketEvent::new(self.symbols[i].clone(), price).with_sequence(self.sequences[i]);
        event.volume = Some(Decimal::from(self.rng.random_range(1..=1000u32)));
        Ok(event)
    }

    async fn close(&mut self) {}
}

/// What one scripted connection does after it is accepted.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(MarketEvent),
    Fail(TransportError),
    /// Stay silent for this long before the next step.
    Idle(Duration),
}

/// Outcome of one scripted connect attempt.
#[derive(Debug, Clone)]
pub enum ConnectScript {
    Refuse(TransportError),
    /// Accept, play the steps, then stay idle.
    Accept(Vec<ScriptStep>),
}

/// A connect attempt seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub at: Instant,
    pub symbols: Vec<String>,
}

/// Transport that plays back a fixed script, one entry per connect attempt.
///
/// Once the script runs out every connect succeeds with an idle connection.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<VecDeque<ConnectScript>>>,
    attempts: Arc<Mutex<Vec<ConnectAttempt>>>,
    closes: Arc<AtomicU32>,
}

impl ScriptedTransport {
    /// Creates a new ScriptedTransport with the given script.
    #[must_use]
    pub fn new(scripts: impl IntoIterator<Item = ConnectScript>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
            ..Default::default()
        }
    }

    pub async fn push(&self, script: ConnectScript) {
        self.scripts.lock().await.push_back(script);
    }

    pub async fn attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts.lock().await.clone()
    }

    /// Number of orderly closes performed by the caller.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketTransport for ScriptedTransport {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn MarketConnection>, TransportError> {
        self.attempts.lock().await.push(ConnectAttempt {
            at: Instant::now(),
            symbols: symbols.to_vec(),
        });
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or(ConnectScript::Accept(Vec::new()));
        debug!(symbols = symbols.len(), script = ?script, "Scripted connect");

        match script {
            ConnectScript::Refuse(err) => Err(err),
            ConnectScript::Accept(steps) => Ok(Box::new(ScriptedConnection {
                steps: steps.into(),
                idle_until: None,
                closes: self.closes.clone(),
            })),
        }
    }
}

struct ScriptedConnection {
    steps: VecDeque<ScriptStep>,
    /// Kept across calls so a dropped read does not lose the idle step.
    idle_until: Option<Instant>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl MarketConnection for ScriptedConnection {
    async fn next_message(&mut self) -> Result<MarketEvent, TransportError> {
        loop {
            if let Some(until) = self.idle_until {
                tokio::time::sleep_until(until).await;
                self.idle_until = None;
            }
            match self.steps.pop_front() {
                Some(ScriptStep::Event(event)) => return Ok(event),
                Some(ScriptStep::Fail(err)) => return Err(err),
                Some(ScriptStep::Idle(wait)) => self.idle_until = Some(Instant::now() + wait),
                None => return std::future::pending().await,
            }
        }
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
