//! Owns the single streaming connection.
//!
//! The desired subscription set lives here and is replayed as one batched
//! subscribe frame on every successful open. Unexpected closes schedule a
//! reconnect with exponential backoff; `disconnect` is terminal.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::market::listeners::{Listener, ListenerHandle, ListenerRegistry};
use crate::market::normalize::{normalize_frame, MarketFrame};
use crate::market::store::{CandleApplyOutcome, LiveStore, TickerApplyOutcome};
use crate::market::types::{
    normalize_symbol, CandleInterval, CandleUpdate, ConnectionState, ConnectionStatus,
    SeriesKey, Subscription, SubscriptionFrame, SubscriptionMethod, Ticker,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub type MarketWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_BACKOFF_EXPONENT: u32 = 64;

pub async fn connect_market_stream(url: &str) -> Result<MarketWsStream, SyncError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

/// `delay = min(initial * multiplier^attempts, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial_ms: config.initial_backoff_ms,
            multiplier: config.backoff_multiplier,
            max_ms: config.max_backoff_ms,
        }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(MAX_BACKOFF_EXPONENT) as i32;
        let scaled = self.initial_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

struct Session {
    id: u64,
    token: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

/// Status work recorded under the state lock and delivered in that order.
enum StatusEvent {
    Publish(ConnectionStatus),
    Greet(Listener<ConnectionStatus>, ConnectionStatus),
    ClearListeners,
}

struct TransportState {
    status: ConnectionStatus,
    attempts: u32,
    subscriptions: BTreeMap<String, Subscription>,
    session: Option<Session>,
    reconnect_timer: Option<CancellationToken>,
    next_session_id: u64,
    status_events: VecDeque<StatusEvent>,
}

impl TransportState {
    fn is_connected(&self) -> bool {
        self.status.state == ConnectionState::Connected
    }

    fn outbound(&self) -> Option<&mpsc::UnboundedSender<Message>> {
        self.session
            .as_ref()
            .and_then(|session| session.outbound.as_ref())
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status.clone();
        self.status_events.push_back(StatusEvent::Publish(status));
    }

    fn is_subscribed(&self, subscription: &Subscription) -> bool {
        self.subscriptions.contains_key(&subscription.key())
    }
}

struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TransportManager {
    stream_url: String,
    backoff: Backoff,
    store: Arc<LiveStore>,
    state: Mutex<TransportState>,
    delivering: AtomicBool,
    ticker_listeners: Arc<ListenerRegistry<Ticker>>,
    candle_listeners: Arc<ListenerRegistry<CandleUpdate>>,
    status_listeners: Arc<ListenerRegistry<ConnectionStatus>>,
    weak_self: Weak<TransportManager>,
}

impl TransportManager {
    pub fn new(config: &SyncConfig, store: Arc<LiveStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            stream_url: config.stream_url.clone(),
            backoff: Backoff::from_config(config),
            store,
            state: Mutex::new(TransportState {
                status: ConnectionStatus::disconnected(Some("stream idle".to_string())),
                attempts: 0,
                subscriptions: BTreeMap::new(),
                session: None,
                reconnect_timer: None,
                next_session_id: 1,
                status_events: VecDeque::new(),
            }),
            delivering: AtomicBool::new(false),
            ticker_listeners: ListenerRegistry::new(),
            candle_listeners: ListenerRegistry::new(),
            status_listeners: ListenerRegistry::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.values().cloned().collect()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.state.lock().reconnect_timer.is_some()
    }

    /// Opens the stream unless a connection is already opening or open.
    /// A scheduled reconnect is cancelled in favour of connecting now.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        {
            let mut state = self.state.lock();
            match state.status.state {
                ConnectionState::Connecting | ConnectionState::Connected => return,
                ConnectionState::Reconnecting => {
                    if let Some(timer) = state.reconnect_timer.take() {
                        timer.cancel();
                    }
                }
                ConnectionState::Disconnected => {}
            }
            self.start_session_locked(&mut state);
        }
        self.deliver_status_events();
    }

    /// Terminal teardown: cancels the reconnect timer and the live session,
    /// then forgets every subscription and listener.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.cancel();
            }
            if let Some(session) = state.session.take() {
                session.token.cancel();
            }
            state.attempts = 0;
            state.subscriptions.clear();
            state.set_status(ConnectionStatus::disconnected(Some(
                "disconnected by client".to_string(),
            )));
            state.status_events.push_back(StatusEvent::ClearListeners);
        }
        info!(url = %self.stream_url, "market stream disconnected by client");
        self.deliver_status_events();
    }

    pub fn subscribe_ticker(&self, symbol: &str) -> Result<bool, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.add_subscription(Subscription::ticker(symbol)))
    }

    /// Also drops the stored snapshot for the symbol.
    pub fn unsubscribe_ticker(&self, symbol: &str) -> Result<bool, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.remove_subscription(Subscription::ticker(symbol)))
    }

    /// Creates the store series the live path writes into.
    pub fn subscribe_candle(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<bool, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.add_subscription(Subscription::candle(symbol, interval)))
    }

    /// Also discards the store series.
    pub fn unsubscribe_candle(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<bool, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.remove_subscription(Subscription::candle(symbol, interval)))
    }

    pub fn on_ticker<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Ticker) + Send + Sync + 'static,
    {
        self.ticker_listeners.register(Arc::new(listener))
    }

    pub fn on_candle<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&CandleUpdate) + Send + Sync + 'static,
    {
        self.candle_listeners.register(Arc::new(listener))
    }

    /// Registers a status listener and calls it with the current status.
    pub fn on_status_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let listener: Listener<ConnectionStatus> = Arc::new(listener);
        let handle = self.status_listeners.register(Arc::clone(&listener));
        {
            let mut state = self.state.lock();
            let current = state.status.clone();
            state
                .status_events
                .push_back(StatusEvent::Greet(listener, current));
        }
        self.deliver_status_events();
        handle
    }

    /// Applies a ticker through the throttled store path and notifies ticker
    /// listeners when it was kept. Used for REST snapshots.
    pub fn publish_ticker(&self, ticker: Ticker) -> TickerApplyOutcome {
        let outcome = self.store.apply_ticker(ticker.clone());
        self.notify_ticker(&ticker, outcome);
        outcome
    }

    fn add_subscription(&self, subscription: Subscription) -> bool {
        let mut state = self.state.lock();
        let key = subscription.key();
        if state.subscriptions.contains_key(&key) {
            return false;
        }
        if let Subscription::Candle { symbol, interval } = &subscription {
            self.store
                .ensure_series(&SeriesKey::new(symbol.clone(), *interval));
        }
        state.subscriptions.insert(key, subscription.clone());
        send_subscription_frame(&state, SubscriptionMethod::Subscribe, subscription);
        true
    }

    fn remove_subscription(&self, subscription: Subscription) -> bool {
        let mut state = self.state.lock();
        if state.subscriptions.remove(&subscription.key()).is_none() {
            return false;
        }
        match &subscription {
            Subscription::Ticker { symbol } => {
                self.store.remove_ticker(symbol);
            }
            Subscription::Candle { symbol, interval } => {
                self.store
                    .remove_series(&SeriesKey::new(symbol.clone(), *interval));
            }
        }
        send_subscription_frame(&state, SubscriptionMethod::Unsubscribe, subscription);
        true
    }

    /// Delivers queued status events in the order they were recorded. The
    /// caller that finds delivery idle drains the queue; concurrent callers
    /// leave their events to it.
    fn deliver_status_events(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _delivering = DeliveryGuard(&self.delivering);
                while let Some(event) = self.next_status_event() {
                    match event {
                        StatusEvent::Publish(status) => self.status_listeners.notify(&status),
                        StatusEvent::Greet(listener, status) => listener(&status),
                        StatusEvent::ClearListeners => {
                            self.ticker_listeners.clear();
                            self.candle_listeners.clear();
                            self.status_listeners.clear();
                        }
                    }
                }
            }
            // An event queued after the last pop but before the flag dropped
            // has no other drainer.
            if self.state.lock().status_events.is_empty() {
                return;
            }
        }
    }

    fn next_status_event(&self) -> Option<StatusEvent> {
        self.state.lock().status_events.pop_front()
    }

    fn start_session_locked(&self, state: &mut TransportState) {
        let id = state.next_session_id;
        state.next_session_id = state.next_session_id.wrapping_add(1);
        let token = CancellationToken::new();
        state.session = Some(Session {
            id,
            token: token.clone(),
            outbound: None,
        });

        let reason = if state.attempts == 0 {
            "opening websocket stream".to_string()
        } else {
            format!("reconnect attempt {}", state.attempts)
        };
        state.set_status(ConnectionStatus {
            state: ConnectionState::Connecting,
            reconnect_attempt: state.attempts,
            reason: Some(reason),
        });

        if let Some(this) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                this.run_session(id, token).await;
            });
        }
    }

    async fn run_session(self: Arc<Self>, id: u64, token: CancellationToken) {
        debug!(session = id, url = %self.stream_url, "opening market stream");
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = connect_market_stream(&self.stream_url) => result,
        };

        let reason = match connected {
            Ok(stream) => self.drive_session(id, &token, stream).await,
            Err(error) => {
                warn!(session = id, %error, "market stream connect failed");
                format!("websocket connect error: {error}")
            }
        };

        self.handle_session_closed(id, reason);
    }

    async fn drive_session(
        &self,
        id: u64,
        token: &CancellationToken,
        stream: MarketWsStream,
    ) -> String {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        if !self.mark_connected(id, outbound_tx) {
            let _ = sink.send(Message::Close(None)).await;
            return "session superseded".to_string();
        }
        info!(session = id, url = %self.stream_url, "market stream connected");
        self.deliver_status_events();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return "connection closed by client".to_string();
                }
                Some(message) = outbound_rx.recv() => {
                    if let Err(error) = sink.send(message).await {
                        // The read half reports the close that follows a dead socket.
                        warn!(session = id, %error, "failed to write stream frame");
                    }
                }
                inbound = source.next() => {
                    let Some(frame_result) = inbound else {
                        return "websocket stream ended".to_string();
                    };
                    match frame_result {
                        Ok(Message::Text(text)) => self.handle_payload(text.into_bytes()),
                        Ok(Message::Binary(payload)) => self.handle_payload(payload),
                        Ok(Message::Ping(payload)) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            return match frame {
                                Some(frame) => format!("websocket closed by server: {}", frame.reason),
                                None => "websocket closed by server".to_string(),
                            };
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(session = id, %error, "market stream read error");
                            return format!("websocket frame error: {error}");
                        }
                    }
                }
            }
        }
    }

    /// Flips to Connected and enqueues the batched resubscribe ahead of any
    /// frame another caller might send once the outbound queue is visible.
    fn mark_connected(&self, id: u64, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(session) = state
            .session
            .as_mut()
            .filter(|session| session.id == id && !session.token.is_cancelled())
        else {
            return false;
        };

        let entries: Vec<Subscription> = state.subscriptions.values().cloned().collect();
        if !entries.is_empty() {
            match SubscriptionFrame::new(SubscriptionMethod::Subscribe, &entries).to_json() {
                Ok(json) => {
                    let _ = outbound.send(Message::Text(json));
                }
                Err(error) => warn!(%error, "failed to encode resubscribe frame"),
            }
        }
        session.outbound = Some(outbound);

        state.attempts = 0;
        state.set_status(ConnectionStatus {
            state: ConnectionState::Connected,
            reconnect_attempt: 0,
            reason: Some("websocket connected".to_string()),
        });
        debug!(session = id, subscriptions = entries.len(), "resubscribed after open");
        true
    }

    fn handle_session_closed(&self, id: u64, reason: String) {
        {
            let mut state = self.state.lock();
            let is_current = state
                .session
                .as_ref()
                .map(|session| session.id == id)
                .unwrap_or(false);
            if !is_current {
                return;
            }
            let Some(session) = state.session.take() else {
                return;
            };
            if session.token.is_cancelled() {
                return;
            }

            info!(session = id, %reason, "market stream closed");
            let attempts = state.attempts;
            state.set_status(ConnectionStatus {
                state: ConnectionState::Disconnected,
                reconnect_attempt: attempts,
                reason: Some(reason),
            });
            self.schedule_reconnect_locked(&mut state);
        }
        self.deliver_status_events();
    }

    fn schedule_reconnect_locked(&self, state: &mut TransportState) {
        if state.reconnect_timer.is_some() {
            return;
        }

        let delay = self.backoff.delay(state.attempts);
        state.attempts = state.attempts.saturating_add(1);
        let timer = CancellationToken::new();
        state.reconnect_timer = Some(timer.clone());
        let attempts = state.attempts;
        state.set_status(ConnectionStatus {
            state: ConnectionState::Reconnecting,
            reconnect_attempt: attempts,
            reason: Some(format!("reconnecting in {}ms", delay.as_millis())),
        });
        warn!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling market stream reconnect"
        );

        let weak_self = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(this) = weak_self.upgrade() {
                        this.fire_reconnect(&timer);
                    }
                }
            }
        });
    }

    fn fire_reconnect(&self, timer: &CancellationToken) {
        {
            let mut state = self.state.lock();
            // disconnect() and connect() cancel the timer under this same lock.
            if timer.is_cancelled() || state.status.state != ConnectionState::Reconnecting {
                return;
            }
            state.reconnect_timer = None;
            self.start_session_locked(&mut state);
        }
        self.deliver_status_events();
    }

    fn notify_ticker(&self, ticker: &Ticker, outcome: TickerApplyOutcome) {
        match outcome {
            TickerApplyOutcome::Applied => self.ticker_listeners.notify(ticker),
            TickerApplyOutcome::Throttled => {
                trace!(symbol = %ticker.symbol, "ticker update throttled");
            }
        }
    }

    /// Frames for keys outside the subscription set are dropped. The check and
    /// the store write share the state lock, so a frame racing an unsubscribe
    /// cannot bring the removed entry back.
    fn handle_payload(&self, mut payload: Vec<u8>) {
        match normalize_frame(payload.as_mut_slice()) {
            Ok(MarketFrame::Ticker(ticker)) => {
                let outcome = {
                    let state = self.state.lock();
                    if !state.is_subscribed(&Subscription::ticker(ticker.symbol.clone())) {
                        trace!(symbol = %ticker.symbol, "dropping ticker for unsubscribed symbol");
                        return;
                    }
                    self.store.apply_ticker(ticker.clone())
                };
                self.notify_ticker(&ticker, outcome);
            }
            Ok(MarketFrame::Candles(updates)) => {
                for update in updates {
                    let outcome = {
                        let state = self.state.lock();
                        let subscription =
                            Subscription::candle(update.key.symbol.clone(), update.key.interval);
                        if !state.is_subscribed(&subscription) {
                            trace!(series = %update.key, "dropping candle for unsubscribed series");
                            continue;
                        }
                        self.store.apply_candle(update.clone())
                    };
                    match outcome {
                        CandleApplyOutcome::Stale {
                            open_time,
                            last_open_time,
                        } => {
                            debug!(
                                series = %update.key,
                                open_time,
                                last_open_time,
                                "ignoring stale live candle"
                            );
                        }
                        CandleApplyOutcome::Untracked => {
                            debug!(series = %update.key, "no series for live candle");
                        }
                        CandleApplyOutcome::Appended | CandleApplyOutcome::Replaced => {
                            self.candle_listeners.notify(&update);
                        }
                    }
                }
            }
            Ok(MarketFrame::SubscriptionAck) => debug!("subscription acknowledged"),
            Err(error) => debug!(%error, "dropping unrecognized stream frame"),
        }
    }
}

fn send_subscription_frame(
    state: &TransportState,
    method: SubscriptionMethod,
    subscription: Subscription,
) {
    if !state.is_connected() {
        return;
    }
    let Some(outbound) = state.outbound() else {
        return;
    };
    let entries = [subscription];
    match SubscriptionFrame::new(method, &entries).to_json() {
        Ok(json) => {
            let _ = outbound.send(Message::Text(json));
        }
        Err(error) => warn!(%error, "failed to encode subscription frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfigArgs;
    use crate::market::types::SeriesKey;
    use serde_json::Value;
    use std::collections::BTreeSet;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::accept_async;

    type ServerStream = WebSocketStream<TcpStream>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn spawn_server() -> (String, mpsc::UnboundedReceiver<ServerStream>) {
        spawn_server_on("127.0.0.1:0").await
    }

    async fn spawn_server_on(bind: &str) -> (String, mpsc::UnboundedReceiver<ServerStream>) {
        let listener = TcpListener::bind(bind)
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        (format!("ws://{addr}/ws"), rx)
    }

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        drop(listener);
        addr.to_string()
    }

    async fn unused_url() -> String {
        format!("ws://{}/ws", unused_addr().await)
    }

    async fn next_status(
        statuses: &mut mpsc::UnboundedReceiver<ConnectionStatus>,
    ) -> ConnectionStatus {
        timeout(WAIT, statuses.recv())
            .await
            .expect("status should arrive")
            .expect("listener channel open")
    }

    async fn send_frames(server: &mut ServerStream, frames: &[&str]) {
        for frame in frames {
            server
                .send(Message::Text(frame.to_string()))
                .await
                .expect("server send should succeed");
        }
    }

    fn test_config(stream_url: String, initial_backoff_ms: u64) -> SyncConfig {
        SyncConfigArgs {
            stream_url: Some(stream_url),
            initial_backoff_ms: Some(initial_backoff_ms),
            max_backoff_ms: Some(initial_backoff_ms * 8),
            ticker_throttle_ms: Some(0),
            ..Default::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn transport(config: &SyncConfig) -> Arc<TransportManager> {
        let store = Arc::new(LiveStore::new(config.ticker_throttle(), config.max_candles));
        TransportManager::new(config, store)
    }

    async fn accept(connections: &mut mpsc::UnboundedReceiver<ServerStream>) -> ServerStream {
        timeout(WAIT, connections.recv())
            .await
            .expect("client should connect in time")
            .expect("server should still be accepting")
    }

    async fn next_json(ws: &mut ServerStream) -> Value {
        loop {
            let message = timeout(WAIT, ws.next())
                .await
                .expect("frame should arrive in time")
                .expect("stream should stay open")
                .expect("frame should be readable");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).expect("client frames are json");
            }
        }
    }

    fn frame_keys(frame: &Value) -> BTreeSet<String> {
        frame["subscription"]
            .as_array()
            .expect("frame should carry a subscription list")
            .iter()
            .map(|entry| match entry["interval"].as_str() {
                Some(interval) => format!(
                    "{}:{}:{}",
                    entry["type"].as_str().unwrap_or_default(),
                    entry["symbol"].as_str().unwrap_or_default(),
                    interval
                ),
                None => format!(
                    "{}:{}",
                    entry["type"].as_str().unwrap_or_default(),
                    entry["symbol"].as_str().unwrap_or_default()
                ),
            })
            .collect()
    }

    fn keys(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    async fn wait_for_state(transport: &TransportManager, expected: ConnectionState) {
        timeout(WAIT, async {
            while transport.status().state != expected {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("transport should reach the expected state");
    }

    #[test]
    fn backoff_sequence_doubles_up_to_cap() {
        let backoff = Backoff {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 30_000,
        };
        let delays: Vec<u64> = (0..8)
            .map(|attempt| backoff.delay(attempt).as_millis() as u64)
            .collect();

        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn replays_net_subscription_set_after_reconnect() {
        let (url, mut connections) = spawn_server().await;
        let config = test_config(url, 200);
        let transport = transport(&config);

        transport.subscribe_ticker("btcusdt").expect("symbol is valid");
        transport
            .subscribe_candle("SOLUSDT", CandleInterval::M5)
            .expect("symbol is valid");
        assert!(!transport.subscribe_ticker("BTCUSDT").expect("symbol is valid"));
        transport.connect();
        transport.connect();

        let mut first = accept(&mut connections).await;
        let batched = next_json(&mut first).await;
        assert_eq!(batched["method"], "subscribe");
        assert_eq!(
            frame_keys(&batched),
            keys(&["candle:SOLUSDT:5m", "ticker:BTCUSDT"])
        );
        wait_for_state(&transport, ConnectionState::Connected).await;

        transport.subscribe_ticker("ETHUSDT").expect("symbol is valid");
        let single = next_json(&mut first).await;
        assert_eq!(single["method"], "subscribe");
        assert_eq!(frame_keys(&single), keys(&["ticker:ETHUSDT"]));

        transport.unsubscribe_ticker("BTCUSDT").expect("symbol is valid");
        let removal = next_json(&mut first).await;
        assert_eq!(removal["method"], "unsubscribe");
        assert_eq!(frame_keys(&removal), keys(&["ticker:BTCUSDT"]));

        first.close(None).await.expect("server close should succeed");
        drop(first);
        wait_for_state(&transport, ConnectionState::Reconnecting).await;

        transport
            .subscribe_candle("ETHUSDT", CandleInterval::H1)
            .expect("symbol is valid");
        transport
            .unsubscribe_candle("SOLUSDT", CandleInterval::M5)
            .expect("symbol is valid");
        transport.subscribe_ticker("ETHUSDT").expect("symbol is valid");

        let mut second = accept(&mut connections).await;
        let replay = next_json(&mut second).await;
        assert_eq!(replay["method"], "subscribe");
        assert_eq!(
            frame_keys(&replay),
            keys(&["candle:ETHUSDT:1h", "ticker:ETHUSDT"])
        );
        wait_for_state(&transport, ConnectionState::Connected).await;
        assert_eq!(transport.status().reconnect_attempt, 0);

        transport.disconnect();
    }

    #[tokio::test]
    async fn duplicate_subscribe_sends_no_wire_traffic() {
        let (url, mut connections) = spawn_server().await;
        let config = test_config(url, 200);
        let transport = transport(&config);
        transport.connect();

        let mut server = accept(&mut connections).await;
        wait_for_state(&transport, ConnectionState::Connected).await;

        assert!(transport.subscribe_ticker("SOLUSDT").expect("symbol is valid"));
        assert!(!transport.subscribe_ticker("SOLUSDT").expect("symbol is valid"));
        assert!(!transport.unsubscribe_ticker("XRPUSDT").expect("symbol is valid"));
        assert!(transport.subscribe_ticker("BTCUSDT").expect("symbol is valid"));

        let first = next_json(&mut server).await;
        let second = next_json(&mut server).await;
        assert_eq!(frame_keys(&first), keys(&["ticker:SOLUSDT"]));
        assert_eq!(frame_keys(&second), keys(&["ticker:BTCUSDT"]));

        transport.disconnect();
    }

    #[tokio::test]
    async fn routes_frames_into_store_and_survives_malformed_ones() {
        let (url, mut connections) = spawn_server().await;
        let config = test_config(url, 200);
        let store = Arc::new(LiveStore::new(Duration::ZERO, config.max_candles));
        let transport = TransportManager::new(&config, Arc::clone(&store));

        let (ticker_tx, mut ticker_rx) = mpsc::unbounded_channel();
        let _ticker_handle = transport.on_ticker(move |ticker| {
            let _ = ticker_tx.send(ticker.clone());
        });
        let (candle_tx, mut candle_rx) = mpsc::unbounded_channel();
        let _candle_handle = transport.on_candle(move |update| {
            let _ = candle_tx.send(update.clone());
        });
        transport.subscribe_ticker("SOLUSDT").expect("symbol is valid");
        transport
            .subscribe_candle("SOLUSDT", CandleInterval::M5)
            .expect("symbol is valid");
        transport.connect();

        let mut server = accept(&mut connections).await;
        wait_for_state(&transport, ConnectionState::Connected).await;
        send_frames(
            &mut server,
            &[
                "not json at all",
                r#"{"type":"heartbeat"}"#,
                r#"{"type":"ticker","symbol":"SOLUSDT","lastPrice":"142.5"}"#,
                r#"{"type":"candle","symbol":"SOLUSDT","interval":"5m","openTime":300000,"close":"1.5"}"#,
            ],
        )
        .await;

        let ticker = timeout(WAIT, ticker_rx.recv())
            .await
            .expect("ticker should arrive")
            .expect("listener channel open");
        assert_eq!(ticker.last_price, 142.5);
        let update = timeout(WAIT, candle_rx.recv())
            .await
            .expect("candle should arrive")
            .expect("listener channel open");
        assert_eq!(update.candle.open_time, 300_000);

        assert_eq!(
            store.ticker("SOLUSDT").map(|snapshot| snapshot.last_price),
            Some(142.5)
        );
        assert_eq!(
            store.series_len(&SeriesKey::new("SOLUSDT", CandleInterval::M5)),
            1
        );
        assert_eq!(transport.status().state, ConnectionState::Connected);
        assert!(connections.try_recv().is_err());

        transport.disconnect();
    }

    #[tokio::test]
    async fn backs_off_across_failed_attempts_until_disconnect() {
        let config = test_config(unused_url().await, 5);
        let transport = transport(&config);
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let _handle = transport.on_status_change(move |status| {
            let _ = status_tx.send(status.clone());
        });

        let initial = status_rx.recv().await.expect("initial status is delivered");
        assert_eq!(initial.state, ConnectionState::Disconnected);

        transport.connect();
        let mut reconnect_attempts = Vec::new();
        while reconnect_attempts.len() < 3 {
            let status = timeout(WAIT, status_rx.recv())
                .await
                .expect("status should arrive")
                .expect("listener channel open");
            if status.state == ConnectionState::Reconnecting {
                reconnect_attempts.push(status.reconnect_attempt);
            }
        }
        assert_eq!(reconnect_attempts, vec![1, 2, 3]);

        transport.disconnect();
        assert_eq!(transport.status().state, ConnectionState::Disconnected);
        assert!(!transport.reconnect_pending());
        assert!(transport.subscriptions().is_empty());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn drops_frames_for_keys_outside_subscription_set() {
        let (url, mut connections) = spawn_server().await;
        let config = test_config(url, 200);
        let store = Arc::new(LiveStore::new(Duration::ZERO, config.max_candles));
        let transport = TransportManager::new(&config, Arc::clone(&store));
        let series = SeriesKey::new("SOLUSDT", CandleInterval::M5);

        let (ticker_tx, mut ticker_rx) = mpsc::unbounded_channel();
        let _ticker_handle = transport.on_ticker(move |ticker| {
            let _ = ticker_tx.send(ticker.symbol.clone());
        });
        transport.subscribe_ticker("SOLUSDT").expect("symbol is valid");
        transport.subscribe_ticker("BTCUSDT").expect("symbol is valid");
        transport
            .subscribe_candle("SOLUSDT", CandleInterval::M5)
            .expect("symbol is valid");
        assert!(store.has_series(&series));
        transport.connect();

        let mut server = accept(&mut connections).await;
        wait_for_state(&transport, ConnectionState::Connected).await;
        send_frames(
            &mut server,
            &[
                r#"{"type":"candle","symbol":"SOLUSDT","interval":"5m","openTime":300000,"close":"1.5"}"#,
                r#"{"type":"ticker","symbol":"SOLUSDT","lastPrice":"142.5"}"#,
            ],
        )
        .await;
        let first = timeout(WAIT, ticker_rx.recv())
            .await
            .expect("ticker should arrive")
            .expect("listener channel open");
        assert_eq!(first, "SOLUSDT");
        assert_eq!(store.series_len(&series), 1);

        transport
            .unsubscribe_candle("SOLUSDT", CandleInterval::M5)
            .expect("symbol is valid");
        transport.unsubscribe_ticker("SOLUSDT").expect("symbol is valid");
        assert!(!store.has_series(&series));
        assert!(store.ticker("SOLUSDT").is_none());

        send_frames(
            &mut server,
            &[
                r#"{"type":"candle","symbol":"SOLUSDT","interval":"5m","openTime":600000,"close":"2.5"}"#,
                r#"{"type":"ticker","symbol":"SOLUSDT","lastPrice":"150"}"#,
                r#"{"type":"ticker","symbol":"XRPUSDT","lastPrice":"0.5"}"#,
                r#"{"type":"ticker","symbol":"BTCUSDT","lastPrice":"64000"}"#,
            ],
        )
        .await;
        let marker = timeout(WAIT, ticker_rx.recv())
            .await
            .expect("ticker should arrive")
            .expect("listener channel open");

        assert_eq!(marker, "BTCUSDT");
        assert!(!store.has_series(&series));
        assert!(store.ticker("SOLUSDT").is_none());
        assert!(store.ticker("XRPUSDT").is_none());

        transport.disconnect();
    }

    #[tokio::test]
    async fn successful_open_resets_backoff_for_next_failure() {
        let addr = unused_addr().await;
        let config = test_config(format!("ws://{addr}/ws"), 5);
        let transport = transport(&config);
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let _handle = transport.on_status_change(move |status| {
            let _ = status_tx.send(status.clone());
        });

        transport.connect();
        loop {
            let status = next_status(&mut status_rx).await;
            if status.state == ConnectionState::Reconnecting && status.reconnect_attempt >= 3 {
                break;
            }
        }

        let (_, mut connections) = spawn_server_on(&addr).await;
        let mut server = accept(&mut connections).await;
        loop {
            let status = next_status(&mut status_rx).await;
            if status.state == ConnectionState::Connected {
                assert_eq!(status.reconnect_attempt, 0);
                break;
            }
        }

        server.close(None).await.expect("server close should succeed");
        drop(server);
        loop {
            let status = next_status(&mut status_rx).await;
            if status.state == ConnectionState::Reconnecting {
                assert_eq!(status.reconnect_attempt, 1);
                assert_eq!(status.reason.as_deref(), Some("reconnecting in 5ms"));
                break;
            }
        }

        transport.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_listeners_observe_transitions_in_order() {
        let config = test_config(unused_url().await, 1);
        let transport = transport(&config);
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let _handle = transport.on_status_change(move |status| {
            let _ = status_tx.send(status.clone());
        });

        transport.connect();
        let mut seen = Vec::new();
        while seen.len() < 40 {
            seen.push(next_status(&mut status_rx).await);
        }
        transport.disconnect();

        for pair in seen.windows(2) {
            let expected_next = match pair[0].state {
                ConnectionState::Disconnected => {
                    vec![ConnectionState::Connecting, ConnectionState::Reconnecting]
                }
                ConnectionState::Connecting => vec![ConnectionState::Disconnected],
                ConnectionState::Reconnecting => vec![ConnectionState::Connecting],
                ConnectionState::Connected => vec![ConnectionState::Disconnected],
            };
            assert!(
                expected_next.contains(&pair[1].state),
                "{:?} followed {:?}",
                pair[1].state,
                pair[0].state
            );
        }
        let attempts: Vec<u32> = seen
            .iter()
            .filter(|status| status.state == ConnectionState::Reconnecting)
            .map(|status| status.reconnect_attempt)
            .collect();
        assert!(attempts.windows(2).all(|pair| pair[1] == pair[0] + 1));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect_timer() {
        let config = test_config(unused_url().await, 60_000);
        let transport = transport(&config);
        transport.subscribe_ticker("SOLUSDT").expect("symbol is valid");

        transport.connect();
        wait_for_state(&transport, ConnectionState::Reconnecting).await;
        assert!(transport.reconnect_pending());

        transport.disconnect();

        assert!(!transport.reconnect_pending());
        assert_eq!(transport.status().state, ConnectionState::Disconnected);
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn status_listener_receives_current_state_and_detaches() {
        let config = test_config(unused_url().await, 60_000);
        let transport = transport(&config);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = transport.on_status_change(move |status| {
            sink.lock().push(status.state);
        });
        assert_eq!(*seen.lock(), vec![ConnectionState::Disconnected]);

        assert!(handle.unsubscribe());
        transport.connect();
        wait_for_state(&transport, ConnectionState::Reconnecting).await;

        assert_eq!(*seen.lock(), vec![ConnectionState::Disconnected]);
        transport.disconnect();
    }
}
