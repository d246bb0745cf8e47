//! Shared, time-derived counter
//!
//! The count is a pure function of elapsed wall time since the counter was
//! started. The background tick task only logs; it never feeds the count.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TICK_PERIOD: Duration = Duration::from_secs(1);
const LOG_EVERY: u64 = 10;

/// Externally visible counter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub count: u64,
    pub counting: bool,
}

/// Result of a start/stop request; `success` is false when nothing changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingResponse {
    pub state: CounterSnapshot,
    pub success: bool,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CounterState {
    /// Frozen value while stopped
    count: u64,
    counting: bool,
    start_time: Instant,
    ticker: Option<Ticker>,
}

impl CounterState {
    fn current(&self, now: Instant) -> u64 {
        if self.counting {
            now.saturating_duration_since(self.start_time).as_secs()
        } else {
            self.count
        }
    }

    fn snapshot(&self, now: Instant) -> CounterSnapshot {
        CounterSnapshot {
            count: self.current(now),
            counting: self.counting,
        }
    }
}

/// Thread-safe counter shared between request handlers and its tick task
#[derive(Clone)]
pub struct CounterStore {
    state: Arc<Mutex<CounterState>>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    /// Create a stopped counter
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CounterState {
                count: 0,
                counting: false,
                start_time: Instant::now(),
                ticker: None,
            })),
        }
    }

    pub async fn start_counting(&self) -> CountingResponse {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.counting {
            return CountingResponse {
                state: state.snapshot(now),
                success: false,
            };
        }

        state.counting = true;
        state.start_time = now;
        state.count = 0;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(self.state.clone(), cancel.clone()));
        state.ticker = Some(Ticker { cancel, handle });
        tracing::info!("Counter started");

        CountingResponse {
            state: state.snapshot(now),
            success: true,
        }
    }

    pub async fn stop_counting(&self) -> CountingResponse {
        let (response, ticker) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if !state.counting {
                return CountingResponse {
                    state: state.snapshot(now),
                    success: false,
                };
            }
            state.count = state.current(now);
            state.counting = false;
            let response = CountingResponse {
                state: state.snapshot(now),
                success: true,
            };
            (response, state.ticker.take())
        };

        // The ticker takes the lock on every wake, so join it unlocked
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(e) = ticker.handle.await {
                tracing::warn!(error = %e, "Counter tick task ended abnormally");
            }
        }
        tracing::info!(count = response.state.count, "Counter stopped");
        response
    }

    /// Whole seconds elapsed since the counter was started
    pub async fn get_count(&self) -> u64 {
        let state = self.state.lock().await;
        state.current(Instant::now())
    }

    pub async fn snapshot(&self) -> CounterSnapshot {
        let state = self.state.lock().await;
        state.snapshot(Instant::now())
    }

    /// Stop the tick task if it is running
    pub async fn shutdown(&self) {
        if self.stop_counting().await.success {
            tracing::debug!("Counter tick task stopped for shutdown");
        }
    }
}

async fn run_ticker(state: Arc<Mutex<CounterState>>, cancel: CancellationToken) {
    tracing::info!("Counter tick task started");
    let mut interval = tokio::time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let state = state.lock().await;
                let count = state.current(Instant::now());
                if count % LOG_EVERY == 0 {
                    tracing::info!(count, "Counter reached");
                }
            }
        }
    }
    tracing::debug!("Counter tick task exited");
}
