//! Shared websocket session machinery.
//!
//! One session owns one socket for one (ticker, venue, market). The run
//! loop handles connect timeouts, subscription frames, heartbeats, frame
//! dispatch into the price store, and reconnection with full-jitter
//! exponential backoff. A session that burns through its reconnect budget
//! parks in a terminal error state; only an explicit reconnect (which
//! replaces the session wholesale) resumes it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::models::{ConnectionState, MarketKind, SessionStatus};
use crate::store::PriceStore;

use super::{Inbound, Venue};

/// Websocket connect budget; a slower handshake is treated as a failure.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed connection attempts before a session goes terminal.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 30_000;
const JITTER_MAX_MS: u64 = 1_000;
const HEARTBEAT_SECS: u64 = 20;
const STOP_GRACE: Duration = Duration::from_secs(2);

pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Full-jitter exponential backoff:
/// `delay = min(30s, 1s * 2^attempt + U(0, 1s))`.
pub struct Backoff {
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9e3779b97f4a7c15),
        }
    }

    /// xorshift64; good enough for jitter.
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << self.attempt.min(16));
        let jitter = (self.next_random() * JITTER_MAX_MS as f64) as u64;
        let ms = exp.saturating_add(jitter).min(BACKOFF_MAX_MS);
        self.attempt += 1;
        Duration::from_millis(ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a session task needs to run.
pub struct SessionContext {
    pub ticker: String,
    pub market: MarketKind,
    pub venue: Arc<dyn Venue>,
    pub store: Arc<PriceStore>,
    pub status_cb: StatusCallback,
}

/// Handle to a running session task.
pub struct SessionHandle {
    state: Arc<RwLock<SessionStatus>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the session worker and return its handle.
    pub fn spawn(ctx: SessionContext) -> Self {
        let venue_id = ctx.venue.venue_id(ctx.market);
        let state = Arc::new(RwLock::new(SessionStatus {
            ticker: ctx.ticker.clone(),
            venue: venue_id,
            market: ctx.market,
            state: ConnectionState::Connecting,
            last_update_ms: 0,
            error: None,
            reconnect_attempts: 0,
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            run(ctx, task_state, shutdown_rx).await;
        });

        Self {
            state,
            shutdown_tx,
            task,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().state == ConnectionState::Connected
    }

    /// Cooperative stop: signals the worker, waits briefly, then detaches.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if timeout(STOP_GRACE, self.task).await.is_err() {
            warn!("session did not stop within grace period");
        }
    }
}

/// Resolves when the shutdown flag flips (or the sender is gone).
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        if rx.changed().await.is_err() {
            // Sender gone: the owner dropped us, stop too.
            return;
        }
        if *rx.borrow() {
            return;
        }
    }
}

enum StreamEnd {
    Manual,
    ServerClosed(String),
    Failed(String),
}

async fn run(
    ctx: SessionContext,
    state: Arc<RwLock<SessionStatus>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    let mut failures: u32 = 0;

    let transition = |next: ConnectionState, error: Option<String>, attempts: u32| {
        let snapshot = {
            let mut status = state.write();
            status.state = next;
            status.error = error;
            status.reconnect_attempts = attempts;
            status.clone()
        };
        (ctx.status_cb)(snapshot);
    };

    loop {
        transition(ConnectionState::Connecting, None, failures);
        let url = ctx.venue.ws_url(&ctx.ticker, ctx.market);
        debug!(url = %url, market = %ctx.market, "connecting websocket");

        let attempt_result = tokio::select! {
            result = timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => Some(result),
            _ = wait_shutdown(&mut shutdown_rx) => None,
        };

        let Some(attempt_result) = attempt_result else {
            transition(
                ConnectionState::Disconnected,
                Some("manual disconnect".to_string()),
                failures,
            );
            return;
        };

        match attempt_result {
            Ok(Ok((ws, _response))) => {
                failures = 0;
                backoff.reset();
                transition(ConnectionState::Connected, None, 0);

                match stream_frames(&ctx, ws, &state, &mut shutdown_rx).await {
                    StreamEnd::Manual => {
                        transition(
                            ConnectionState::Disconnected,
                            Some("manual disconnect".to_string()),
                            0,
                        );
                        return;
                    }
                    StreamEnd::ServerClosed(reason) => {
                        transition(ConnectionState::Disconnected, Some(reason), failures);
                    }
                    StreamEnd::Failed(error) => {
                        transition(ConnectionState::Error, Some(error), failures);
                    }
                }
            }
            Ok(Err(e)) => {
                transition(ConnectionState::Error, Some(e.to_string()), failures);
            }
            Err(_elapsed) => {
                transition(
                    ConnectionState::Error,
                    Some("connect timeout".to_string()),
                    failures,
                );
            }
        }

        failures += 1;
        if failures >= MAX_CONSECUTIVE_FAILURES {
            transition(
                ConnectionState::Error,
                Some("reconnect budget exhausted; awaiting manual reconnect".to_string()),
                failures,
            );
            return;
        }

        let delay = backoff.next_delay();
        debug!(
            delay_ms = delay.as_millis() as u64,
            failures, "scheduling reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown_rx) => {
                transition(
                    ConnectionState::Disconnected,
                    Some("manual disconnect".to_string()),
                    failures,
                );
                return;
            }
        }
    }
}

async fn stream_frames(
    ctx: &SessionContext,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    state: &Arc<RwLock<SessionStatus>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let (mut write, mut read) = ws.split();

    for frame in ctx.venue.subscribe_frames(&ctx.ticker, ctx.market) {
        debug!(frame = %frame, "sending subscribe frame");
        if let Err(e) = write.send(Message::Text(frame)).await {
            return StreamEnd::Failed(format!("subscribe send failed: {e}"));
        }
    }

    let period = Duration::from_secs(HEARTBEAT_SECS);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let record_sample = |sample: crate::models::PriceSample| {
        state.write().last_update_ms = chrono::Utc::now().timestamp_millis();
        ctx.store.update_price(&ctx.ticker, sample);
    };

    loop {
        tokio::select! {
            _ = wait_shutdown(shutdown_rx) => {
                let _ = write
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "manual disconnect".into(),
                    })))
                    .await;
                return StreamEnd::Manual;
            }
            _ = heartbeat.tick() => {
                if let Some(frame) = ctx.venue.heartbeat_frame(ctx.market) {
                    let _ = write.send(Message::Text(frame)).await;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match ctx.venue.parse_text(&text, &ctx.ticker, ctx.market) {
                        Inbound::Sample(sample) => record_sample(sample),
                        Inbound::Reply(frame) => {
                            let _ = write.send(Message::Text(frame)).await;
                        }
                        Inbound::Ignore => {}
                    }
                }
                Some(Ok(Message::Binary(payload))) => {
                    if let Some(sample) =
                        ctx.venue.parse_binary(&payload, &ctx.ticker, ctx.market)
                    {
                        record_sample(sample);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("server close: {}", f.reason))
                        .unwrap_or_else(|| "server close".to_string());
                    return StreamEnd::ServerClosed(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return StreamEnd::Failed(e.to_string()),
                None => return StreamEnd::ServerClosed("stream ended".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff_bounded_and_monotonic_base() {
        let mut backoff = Backoff::new();
        let mut prev_floor = 0u64;

        for attempt in 0..10 {
            let delay = backoff.next_delay().as_millis() as u64;
            let floor = (BACKOFF_BASE_MS << attempt.min(16)).min(BACKOFF_MAX_MS);
            // Within [2^k base, min(cap, 2^k base + jitter)].
            assert!(delay <= BACKOFF_MAX_MS, "delay {delay} exceeds cap");
            assert!(
                delay >= floor.min(BACKOFF_MAX_MS - JITTER_MAX_MS) || delay == BACKOFF_MAX_MS,
                "delay {delay} below floor {floor}"
            );
            // Expectation is non-decreasing: the deterministic part never shrinks.
            assert!(floor >= prev_floor);
            prev_floor = floor;
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay().as_millis() as u64;
        assert!(delay < BACKOFF_BASE_MS + JITTER_MAX_MS + 1);
    }

    /// Venue stub pointing at a closed local port: every connect is refused.
    struct UnreachableVenue;

    #[async_trait::async_trait]
    impl Venue for UnreachableVenue {
        fn exchange(&self) -> Exchange {
            Exchange::Binance
        }

        fn symbol(&self, ticker: &str, _market: MarketKind) -> String {
            format!("{ticker}USDT")
        }

        fn ws_url(&self, _ticker: &str, _market: MarketKind) -> String {
            // Reserved port; nothing listens here.
            "ws://127.0.0.1:9/ws".to_string()
        }

        fn subscribe_frames(&self, _ticker: &str, _market: MarketKind) -> Vec<String> {
            Vec::new()
        }

        fn parse_text(&self, _raw: &str, _ticker: &str, _market: MarketKind) -> Inbound {
            Inbound::Ignore
        }

        async fn check_listing(
            &self,
            _client: &reqwest::Client,
            _ticker: &str,
        ) -> crate::models::ListingStatus {
            crate::models::ListingStatus::unlisted()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_goes_terminal() {
        let store = Arc::new(PriceStore::new());
        let trace: Arc<Mutex<Vec<(ConnectionState, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let trace_cb = trace.clone();

        let handle = SessionHandle::spawn(SessionContext {
            ticker: "BTC".to_string(),
            market: MarketKind::Spot,
            venue: Arc::new(UnreachableVenue),
            store,
            status_cb: Arc::new(move |status| {
                trace_cb.lock().push((status.state, status.reconnect_attempts));
            }),
        });

        // Paused clock: sleeps auto-advance once the refused connects resolve.
        let deadline = std::time::Duration::from_secs(120);
        let _ = timeout(deadline, async {
            loop {
                {
                    let trace = trace.lock();
                    if trace
                        .iter()
                        .any(|(s, a)| *s == ConnectionState::Error && *a >= MAX_CONSECUTIVE_FAILURES)
                    {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        let snapshot = trace.lock().clone();
        let connecting = snapshot
            .iter()
            .filter(|(s, _)| *s == ConnectionState::Connecting)
            .count();
        let errors = snapshot
            .iter()
            .filter(|(s, _)| *s == ConnectionState::Error)
            .count();

        // Five connecting->error pairs, then one terminal error status.
        assert_eq!(connecting, MAX_CONSECUTIVE_FAILURES as usize);
        assert_eq!(errors, MAX_CONSECUTIVE_FAILURES as usize + 1);
        let (last_state, last_attempts) = *snapshot.last().unwrap();
        assert_eq!(last_state, ConnectionState::Error);
        assert_eq!(last_attempts, MAX_CONSECUTIVE_FAILURES);

        // The task parked itself; no sixth attempt is scheduled.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(trace.lock().len(), snapshot.len());
        handle.stop().await;
    }
}
