/**
 * SCHEDULER - One timer per source, samples onto the bus
 *
 * STATES :
 * Idle -> Running -> (tick) Fetching -> Publishing -> Running
 * Running -> (stop) Draining -> Stopped
 *
 * RULES :
 * - First fetch happens right at start, then every `providers.interval_secs`
 * - A failed or timed out fetch skips the tick, the next one tries again;
 *   the fetch's cancel token fires at the deadline
 * - Source teardown gets the same deadline
 * - Publishing is best effort: a refused instance does not stop the batch
 * - Stop is only observed between ticks, so an in-flight fetch always ends
 */

use crate::bus::{Event, Publisher};
use crate::config::ConfigStore;
use crate::source::Source;
use crate::state::{new_state, Shared};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScraperState {
    Idle,
    Running,
    Fetching,
    Publishing,
    Draining,
    Stopped,
}

/// Live state of every scraper, shared with the health endpoint
pub type ScraperStates = Shared<BTreeMap<String, ScraperState>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    pub fetched: usize,
    pub published: usize,
    pub refused: usize,
}

fn set_state(states: &ScraperStates, name: &str, state: ScraperState) {
    states.lock().insert(name.to_string(), state);
}

/// One fetch and publish cycle. `None` when the fetch failed or timed out.
pub async fn scrape_once(
    source: &dyn Source,
    publisher: &Publisher,
    fetch_timeout: Duration,
    states: &ScraperStates,
) -> Option<ScrapeReport> {
    let name = source.name();
    set_state(states, name, ScraperState::Fetching);

    let cancel = CancellationToken::new();
    let fetched = tokio::time::timeout(fetch_timeout, source.fetch(&cancel)).await;
    let instances = match fetched {
        Ok(Ok(instances)) => instances,
        Ok(Err(e)) => {
            warn!(source = name, error = %e, "fetch failed, tick skipped");
            return None;
        }
        Err(_) => {
            cancel.cancel();
            warn!(source = name, timeout_ms = fetch_timeout.as_millis() as u64, "fetch timed out, tick skipped");
            return None;
        }
    };

    set_state(states, name, ScraperState::Publishing);
    let mut report = ScrapeReport { fetched: instances.len(), ..Default::default() };
    for (id, instance) in instances {
        match publisher.publish(Event::metrics_collected(instance)).await {
            Ok(()) => report.published += 1,
            Err(e) => {
                report.refused += 1;
                warn!(source = name, instance = %id, error = %e, "publish refused");
            }
        }
    }
    debug!(source = name, fetched = report.fetched, published = report.published, "scrape done");
    Some(report)
}

/// Drives one source on its own timer
pub struct Scraper {
    source: Arc<dyn Source>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Scraper {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self { source, stop_tx: None, task: None }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn start(&mut self, publisher: Publisher, config: ConfigStore, states: ScraperStates) {
        if self.task.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(run(self.source.clone(), publisher, config, states, stop_rx)));
    }

    fn signal_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(source = self.source.name(), error = %e, "scraper task ended abnormally");
            }
        }
    }

    /// Waits for the in-flight cycle, if any, then tears the source down
    pub async fn stop(&mut self) {
        self.signal_stop();
        self.join().await;
    }
}

async fn run(
    source: Arc<dyn Source>,
    publisher: Publisher,
    config: ConfigStore,
    states: ScraperStates,
    mut stop: watch::Receiver<bool>,
) {
    let name = source.name().to_string();
    let mut period = config.current().interval();
    // first tick fires immediately
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(source = %name, period_secs = period.as_secs(), "scraper started");

    loop {
        set_state(&states, &name, ScraperState::Running);
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let cfg = config.current();
        scrape_once(source.as_ref(), &publisher, cfg.fetch_timeout(), &states).await;
        if *stop.borrow() {
            break;
        }

        // hot reloaded interval
        let wanted = cfg.interval();
        if wanted != period {
            info!(source = %name, period_secs = wanted.as_secs(), "scrape interval changed");
            period = wanted;
            ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
    }

    set_state(&states, &name, ScraperState::Draining);
    let cancel = CancellationToken::new();
    match tokio::time::timeout(config.current().fetch_timeout(), source.stop(&cancel)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(source = %name, error = %e, "source stop failed"),
        Err(_) => {
            cancel.cancel();
            warn!(source = %name, "source stop timed out");
        }
    }
    set_state(&states, &name, ScraperState::Stopped);
    info!(source = %name, "scraper stopped");
}

/// Owns every scraper
pub struct ScrapingManager {
    scrapers: Vec<Scraper>,
    publisher: Publisher,
    config: ConfigStore,
    states: ScraperStates,
}

impl ScrapingManager {
    pub fn new(publisher: Publisher, config: ConfigStore) -> Self {
        Self { scrapers: vec![], publisher, config, states: new_state(BTreeMap::new()) }
    }

    pub fn add(&mut self, source: Arc<dyn Source>) {
        set_state(&self.states, source.name(), ScraperState::Idle);
        self.scrapers.push(Scraper::new(source));
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }

    pub fn states(&self) -> ScraperStates {
        self.states.clone()
    }

    pub fn start(&mut self) {
        for scraper in &mut self.scrapers {
            scraper.start(self.publisher.clone(), self.config.clone(), self.states.clone());
        }
        info!(scrapers = self.scrapers.len(), "scraping manager started");
    }

    /// Signals every scraper first so they all wind down together
    pub async fn stop(&mut self) {
        for scraper in &mut self.scrapers {
            scraper.signal_stop();
        }
        for scraper in &mut self.scrapers {
            scraper.join().await;
        }
        info!("scraping manager stopped");
    }
}
