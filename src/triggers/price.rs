//! Price triggers: a push stream of observations fans out to per-trigger
//! condition trackers. A trigger fires once its condition has held for
//! the configured duration; re-fires inside the debounce window are
//! suppressed, and a stale feed suspends evaluation entirely.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::warn;
use uuid::Uuid;

use super::{FireCause, KindState, PriceCondition, TriggerEngine};
use crate::database::types::TriggerStatus;

/// How often pending conditions are re-evaluated between observations.
const EVALUATION_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub asset_pair: String,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// The price-feed collaborator: a broadcast stream of observations.
pub trait PriceFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PriceTick>;
}

/// Push-driven feed for development and tests.
pub struct ChannelPriceFeed {
    sender: broadcast::Sender<PriceTick>,
}

impl ChannelPriceFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn push(&self, tick: PriceTick) {
        let _ = self.sender.send(tick);
    }
}

impl PriceFeed for ChannelPriceFeed {
    fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.sender.subscribe()
    }
}

/// Polls an HTTP endpoint returning a JSON object of `pair -> price` and
/// pushes every observation onto the broadcast stream.
pub struct HttpPriceFeed {
    http: reqwest::Client,
    url: String,
    interval: Duration,
    sender: broadcast::Sender<PriceTick>,
}

impl HttpPriceFeed {
    pub fn new(url: String, interval: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(interval).build()?;
        let (sender, _receiver) = broadcast::channel(256);

        Ok(Self {
            http,
            url,
            interval,
            sender,
        })
    }

    /// Polling loop; runs until cancelled by the task monitor.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            match self.poll_once().await {
                Ok(observed) => {
                    if observed == 0 {
                        warn!(url = %self.url, "Price feed returned no pairs");
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, ?err, "Price poll failed");
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    async fn poll_once(&self) -> anyhow::Result<usize> {
        let response = self.http.get(&self.url).send().await?;
        let body: serde_json::Map<String, Value> = response.json().await?;

        let at = Utc::now();
        let mut observed = 0;

        for (asset_pair, price) in body {
            let Some(price) = price.as_f64() else {
                continue;
            };

            let _ = self.sender.send(PriceTick {
                asset_pair,
                price,
                at,
            });
            observed += 1;
        }

        Ok(observed)
    }
}

impl PriceFeed for HttpPriceFeed {
    fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerOutcome {
    /// Nothing to do.
    Idle,
    /// The condition matured; fire now.
    Fire,
    /// The condition matured inside the debounce window.
    Debounced,
}

/// Pure condition state for one price trigger. Time is always passed in,
/// which keeps the scenario timelines testable without a clock.
pub struct PriceConditionTracker {
    condition: PriceCondition,
    threshold: f64,
    duration: chrono::Duration,
    debounce: chrono::Duration,
    held_since: Option<DateTime<Utc>>,
    fired_for_entry: bool,
    last_fired: Option<DateTime<Utc>>,
    last_observation: Option<DateTime<Utc>>,
    last_price: Option<f64>,
}

impl PriceConditionTracker {
    #[must_use]
    pub fn new(
        condition: PriceCondition,
        threshold: f64,
        duration: chrono::Duration,
        debounce: chrono::Duration,
    ) -> Self {
        Self {
            condition,
            threshold,
            duration,
            debounce,
            held_since: None,
            fired_for_entry: false,
            last_fired: None,
            last_observation: None,
            last_price: None,
        }
    }

    pub fn observe(&mut self, price: f64, at: DateTime<Utc>) {
        self.last_observation = Some(at);
        self.last_price = Some(price);

        let satisfied = match self.condition {
            PriceCondition::Above => price > self.threshold,
            PriceCondition::Below => price < self.threshold,
        };

        if satisfied {
            if self.held_since.is_none() {
                // The condition must hold continuously from here; a
                // contrary observation resets the clock.
                self.held_since = Some(at);
                self.fired_for_entry = false;
            }
        } else {
            self.held_since = None;
            self.fired_for_entry = false;
        }
    }

    /// Checks whether the condition has matured at `now`. A feed silent
    /// for longer than `staleness` suspends the trigger instead of
    /// firing it.
    pub fn evaluate(&mut self, now: DateTime<Utc>, staleness: chrono::Duration) -> TrackerOutcome {
        let Some(last_observation) = self.last_observation else {
            return TrackerOutcome::Idle;
        };

        if now - last_observation > staleness {
            return TrackerOutcome::Idle;
        }

        let Some(held_since) = self.held_since else {
            return TrackerOutcome::Idle;
        };

        if self.fired_for_entry || now - held_since < self.duration {
            return TrackerOutcome::Idle;
        }

        self.fired_for_entry = true;

        if let Some(last_fired) = self.last_fired {
            if now - last_fired < self.debounce {
                return TrackerOutcome::Debounced;
            }
        }

        self.last_fired = Some(now);
        TrackerOutcome::Fire
    }

    #[must_use]
    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }
}

/// Fans the feed out to the trackers and periodically evaluates them.
/// Runs until cancelled by the task monitor.
pub async fn run_price_watcher(
    engine: Arc<TriggerEngine>,
    feed: Arc<dyn PriceFeed>,
) -> anyhow::Result<()> {
    let mut receiver = feed.subscribe();
    let mut ticker = interval(EVALUATION_TICK);

    loop {
        tokio::select! {
            observation = receiver.recv() => match observation {
                Ok(tick) => observe(&engine, &tick).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Price watcher lagged behind the feed");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("price feed closed");
                }
            },
            _ = ticker.tick() => {
                evaluate(&engine, Utc::now()).await?;
            }
        }
    }
}

async fn observe(engine: &TriggerEngine, tick: &PriceTick) {
    let mut index = engine.index.lock().await;

    for active in index.values_mut() {
        let KindState::Price { config, tracker } = &mut active.state else {
            continue;
        };

        if config.asset_pair == tick.asset_pair {
            tracker.observe(tick.price, tick.at);
        }
    }
}

async fn evaluate(engine: &TriggerEngine, now: DateTime<Utc>) -> anyhow::Result<()> {
    let staleness = chrono::Duration::from_std(engine.config().price_staleness)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));

    let mut fires: Vec<(Uuid, Value)> = Vec::new();
    let mut debounced: Vec<Uuid> = Vec::new();

    {
        let mut index = engine.index.lock().await;
        for active in index.values_mut() {
            if active.status != TriggerStatus::Active {
                continue;
            }

            let KindState::Price { config, tracker } = &mut active.state else {
                continue;
            };

            match tracker.evaluate(now, staleness) {
                TrackerOutcome::Idle => {}
                TrackerOutcome::Fire => {
                    let mut params = config.params.clone();
                    if let Value::Object(map) = &mut params {
                        map.insert(
                            "price".to_string(),
                            tracker
                                .last_price()
                                .and_then(serde_json::Number::from_f64)
                                .map(Value::Number)
                                .unwrap_or(Value::Null),
                        );
                    }
                    fires.push((active.id, params));
                }
                TrackerOutcome::Debounced => debounced.push(active.id),
            }
        }
    }

    for (trigger_id, params) in fires {
        if let Err(err) = engine.fire(trigger_id, params, FireCause::PriceCondition).await {
            warn!(trigger = %trigger_id, ?err, "Price fire failed");
        }
    }

    for trigger_id in debounced {
        engine
            .record_skip(trigger_id, "suppressed by debounce window")
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn tracker() -> PriceConditionTracker {
        PriceConditionTracker::new(
            PriceCondition::Above,
            10.0,
            chrono::Duration::seconds(30),
            chrono::Duration::seconds(60),
        )
    }

    fn staleness() -> chrono::Duration {
        chrono::Duration::seconds(120)
    }

    /// Prices 9.5 (t=0), 10.5 (t=10), 10.5 (t=45), 9.5 (t=50), 10.5
    /// (t=60): exactly one fire, at t=40.
    #[test]
    fn sustained_condition_fires_exactly_once()  {
        let mut tracker = tracker();
        let mut fires = Vec::new();

        let observations = [
            (0, 9.5),
            (10, 10.5),
            (45, 10.5),
            (50, 9.5),
            (60, 10.5),
        ];

        let mut next_observation = 0;
        for second in 0..=70 {
            while next_observation < observations.len()
                && observations[next_observation].0 == second
            {
                tracker.observe(observations[next_observation].1, at(second));
                next_observation += 1;
            }

            if tracker.evaluate(at(second), staleness()) == TrackerOutcome::Fire {
                fires.push(second);
            }
        }

        assert_eq!(fires, vec![40]);
    }

    #[test]
    fn refire_within_debounce_is_suppressed() {
        let mut tracker = tracker();

        tracker.observe(10.5, at(0));
        assert_eq!(tracker.evaluate(at(30), staleness()), TrackerOutcome::Fire);

        // Condition breaks and re-enters quickly.
        tracker.observe(9.0, at(35));
        tracker.observe(10.5, at(40));

        assert_eq!(
            tracker.evaluate(at(70), staleness()),
            TrackerOutcome::Debounced
        );

        // A later re-entry outside the debounce window fires again.
        tracker.observe(9.0, at(75));
        tracker.observe(10.5, at(80));
        assert_eq!(tracker.evaluate(at(110), staleness()), TrackerOutcome::Fire);
    }

    #[test]
    fn below_condition() {
        let mut tracker = PriceConditionTracker::new(
            PriceCondition::Below,
            10.0,
            chrono::Duration::seconds(10),
            chrono::Duration::seconds(60),
        );

        tracker.observe(9.0, at(0));
        assert_eq!(tracker.evaluate(at(5), staleness()), TrackerOutcome::Idle);
        assert_eq!(tracker.evaluate(at(10), staleness()), TrackerOutcome::Fire);
    }

    #[test]
    fn stale_feed_suspends_firing() {
        let mut tracker = tracker();

        tracker.observe(10.5, at(0));

        // Matured, but the last observation is older than the staleness
        // window: suspended, not fired.
        assert_eq!(
            tracker.evaluate(at(200), staleness()),
            TrackerOutcome::Idle
        );

        // A fresh observation revives it; the hold was never reset.
        tracker.observe(10.5, at(210));
        assert_eq!(tracker.evaluate(at(211), staleness()), TrackerOutcome::Fire);
    }

    #[test]
    fn contrary_observation_resets_the_clock() {
        let mut tracker = tracker();

        tracker.observe(10.5, at(0));
        tracker.observe(9.9, at(20));
        tracker.observe(10.5, at(25));

        assert_eq!(tracker.evaluate(at(40), staleness()), TrackerOutcome::Idle);
        assert_eq!(tracker.evaluate(at(55), staleness()), TrackerOutcome::Fire);
    }
}
