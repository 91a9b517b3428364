//! Connection manager
//!
//! Owns the one feed session of the process and drives it through
//! `Disconnected -> Connecting -> Connected -> (Dead | Error) -> Reconnecting -> Connecting ...`
//! from a single control loop. Cancellation moves it to `ShuttingDown`, and
//! closing the returned [`StoppedSession`] ends in `Disconnected`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::buffer::IngestBuffer;
use crate::clock::LocalClock;
use crate::codec::{ping_request, subscribe_request, ControlEvent, Decoded, Subscription, WireCodec};
use crate::config::Config;
use crate::error::RecorderError;
use crate::metrics;
use crate::transport::{FeedSession, Inbound, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Dead,
    Error,
    Reconnecting,
    ShuttingDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Dead => "dead",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers (health server, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// All subscribe acks received, or the ack wait timed out.
    pub subscriptions_ready: bool,
    /// Sessions established since start.
    pub sessions: u64,
}

impl SessionStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected && self.subscriptions_ready
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            subscriptions_ready: false,
            sessions: 0,
        }
    }
}

/// Why a connected session stopped streaming.
enum SessionEnd {
    Shutdown,
    Dead(RecorderError),
    Failed(RecorderError),
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    codec: WireCodec,
    clock: LocalClock,
    subscriptions: Vec<Subscription>,
    buffer: Arc<IngestBuffer>,
    backoff: Backoff,
    connect_timeout: Duration,
    subscribe_timeout: Duration,
    ping_interval: Duration,
    staleness_window: Duration,
    status: watch::Sender<SessionStatus>,
}

impl ConnectionManager {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, buffer: Arc<IngestBuffer>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            transport,
            codec: WireCodec::new(
                config.feed.instruments.iter().cloned(),
                config.feed.channels.iter().cloned(),
            ),
            clock: LocalClock::new(),
            subscriptions: config.subscriptions(),
            buffer,
            backoff: Backoff::new(&config.backoff),
            connect_timeout: config.feed.connect_timeout,
            subscribe_timeout: config.feed.subscribe_timeout,
            ping_interval: config.feed.ping_interval,
            staleness_window: config.feed.staleness_window,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| {
            s.state = state;
            s.subscriptions_ready = false;
            if state == ConnectionState::Connected {
                s.sessions += 1;
            }
        });
        metrics::inc_state_transition(state.as_str());
        metrics::set_connected(state == ConnectionState::Connected);
        info!(state = %state, "Connection state changed");
    }

    fn set_subscriptions_ready(&self) {
        self.status.send_modify(|s| s.subscriptions_ready = true);
    }

    /// Run until `shutdown` is cancelled. Never gives up on the feed by itself.
    ///
    /// The still-open session, if any, is handed back so it can be closed
    /// after the final flush.
    pub async fn run(mut self, shutdown: CancellationToken) -> StoppedSession {
        loop {
            if shutdown.is_cancelled() {
                return self.stopped(None);
            }

            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.stopped(None),
                result = timeout(self.connect_timeout, self.transport.connect()) => result,
            };

            match attempt {
                Ok(Ok(mut session)) => {
                    self.set_state(ConnectionState::Connected);
                    let connected_at = Instant::now();

                    let end = self.stream(session.as_mut(), &shutdown).await;
                    match end {
                        SessionEnd::Shutdown => return self.stopped(Some(session)),
                        SessionEnd::Dead(e) => {
                            self.record_failure(&e);
                            self.set_state(ConnectionState::Dead);
                        }
                        SessionEnd::Failed(e) => {
                            self.record_failure(&e);
                            self.set_state(ConnectionState::Error);
                        }
                    }
                    if let Err(e) = session.close().await {
                        debug!(error = %e, "Closing dropped session failed");
                    }
                    self.backoff.session_ended(connected_at.elapsed());
                }
                Ok(Err(e)) => self.record_failure(&e),
                Err(_) => self.record_failure(&RecorderError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                ))),
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            metrics::inc_reconnect_attempt();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempt(),
                "Reconnecting after backoff"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.stopped(None),
                _ = sleep(delay) => {}
            }
        }
    }

    fn record_failure(&self, error: &RecorderError) {
        metrics::inc_connection_error(error.kind());
        warn!(error = %error, kind = error.kind(), "Feed connection failed");
    }

    fn stopped(self, session: Option<Box<dyn FeedSession>>) -> StoppedSession {
        self.set_state(ConnectionState::ShuttingDown);
        StoppedSession {
            session,
            status: self.status,
        }
    }

    /// Subscribe, then read frames until the session dies or shutdown is requested.
    async fn stream(
        &mut self,
        session: &mut dyn FeedSession,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        for subscription in &self.subscriptions {
            debug!(subscription = %subscription, "Subscribing");
            if let Err(e) = session.send(subscribe_request(subscription)).await {
                return SessionEnd::Failed(e);
            }
        }

        let mut pending: HashSet<Subscription> = self.subscriptions.iter().cloned().collect();
        let mut ready = pending.is_empty();
        let subscribe_deadline = Instant::now() + self.subscribe_timeout;

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        loop {
            let stale_at = last_activity + self.staleness_window;
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Shutdown,

                _ = sleep_until(subscribe_deadline), if !ready => {
                    ready = true;
                    let err = RecorderError::SubscribeTimeout(self.subscribe_timeout);
                    metrics::inc_connection_error(err.kind());
                    warn!(
                        pending = ?pending.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                        "{}; treating session as ready", err
                    );
                    self.set_subscriptions_ready();
                }

                _ = sleep_until(stale_at) => {
                    return SessionEnd::Dead(RecorderError::StaleConnection(self.staleness_window));
                }

                _ = ping.tick() => {
                    trace!(idle_ms = last_activity.elapsed().as_millis() as u64, "Sending ping");
                    if let Err(e) = session.send(ping_request()).await {
                        return SessionEnd::Failed(e);
                    }
                }

                frame = session.recv() => match frame {
                    Some(Ok(Inbound::Keepalive)) => {
                        last_activity = Instant::now();
                        metrics::inc_message_received();
                        trace!("Transport keepalive");
                    }
                    Some(Ok(Inbound::Text(text))) => {
                        last_activity = Instant::now();
                        if self.handle_frame(&text, &mut pending) && !ready {
                            ready = true;
                            info!(subscriptions = self.subscriptions.len(), "All subscriptions acknowledged");
                            self.set_subscriptions_ready();
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => {
                        return SessionEnd::Failed(RecorderError::Transport(
                            "session closed by peer".into(),
                        ))
                    }
                },
            }
        }
    }

    /// Route one frame. Returns true when the last pending subscription was acked.
    fn handle_frame(&mut self, text: &str, pending: &mut HashSet<Subscription>) -> bool {
        metrics::inc_message_received();
        match self.codec.decode(text, &mut self.clock) {
            Ok(Decoded::Update(update)) => {
                metrics::inc_update_buffered(update.instrument());
                let depth = self.buffer.append(update);
                metrics::set_buffer_depth(depth);
                false
            }
            Ok(Decoded::Unconfigured { instrument }) => {
                metrics::inc_unconfigured_instrument();
                debug!(instrument = %instrument, "Dropping update for unconfigured instrument");
                false
            }
            Ok(Decoded::Control(event)) => {
                metrics::inc_control_event(event.kind());
                match event {
                    ControlEvent::SubscribeAck(subscription) => {
                        let acked = pending.remove(&subscription);
                        debug!(subscription = %subscription, acked, "Subscribe acknowledged");
                        acked && pending.is_empty()
                    }
                    ControlEvent::FeedError(message) => {
                        warn!(message = %message, "Feed reported an error");
                        false
                    }
                    ControlEvent::Pong => {
                        trace!("Received pong");
                        false
                    }
                    ControlEvent::Greeting => {
                        debug!("Received feed greeting");
                        false
                    }
                    ControlEvent::Other(channel) => {
                        trace!(channel = %channel, "Ignoring frame");
                        false
                    }
                }
            }
            Err(e) => {
                metrics::inc_decode_failure(e.kind());
                let raw: String = text.chars().take(256).collect();
                warn!(error = %e, kind = e.kind(), raw = %raw, "Dropping undecodable frame");
                false
            }
        }
    }
}

/// Returned by [`ConnectionManager::run`] once it has stopped reading.
pub struct StoppedSession {
    session: Option<Box<dyn FeedSession>>,
    status: watch::Sender<SessionStatus>,
}

impl StoppedSession {
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Close the transport and publish the terminal `Disconnected` state.
    pub async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!("Feed session closed"),
                Err(e) => warn!(error = %e, "Failed to close feed session cleanly"),
            }
        }
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.subscriptions_ready = false;
        });
        metrics::inc_state_transition(ConnectionState::Disconnected.as_str());
        metrics::set_connected(false);
        info!(state = %ConnectionState::Disconnected, "Connection state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SealedBatches;
    use crate::transport::{ChannelPeer, ChannelTransport};
    use tokio::sync::mpsc;

    const BOOK: &str = r#"{"channel":"l2Book","data":{"coin":"BTC","time":1760000000000,"levels":[[{"px":"64000.5","sz":"0.25","n":3}],[{"px":"64001.0","sz":"1.0","n":1}]]}}"#;

    fn config(instruments: &[&str]) -> Config {
        let list = instruments
            .iter()
            .map(|i| format!("\"{}\"", i))
            .collect::<Vec<_>>()
            .join(", ");
        Config::from_yaml(&format!(
            r#"
feed:
  url: "wss://api.hyperliquid.xyz/ws"
  instruments: [{list}]
  subscribe_timeout: 5s
  ping_interval: 50s
  staleness_window: 100s
storage:
  data_dir: /tmp/lobrec-test
"#
        ))
        .unwrap()
    }

    fn ack(instrument: &str) -> String {
        format!(
            r#"{{"channel":"subscriptionResponse","data":{{"method":"subscribe","subscription":{{"type":"l2Book","coin":"{}"}}}}}}"#,
            instrument
        )
    }

    struct Harness {
        transport: Arc<ChannelTransport>,
        peers: mpsc::UnboundedReceiver<ChannelPeer>,
        buffer: Arc<IngestBuffer>,
        _sealed: SealedBatches,
        status: watch::Receiver<SessionStatus>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<StoppedSession>,
    }

    fn start(config: &Config) -> Harness {
        let (transport, peers) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let (buffer, sealed) = IngestBuffer::new(1000, 4);
        let buffer = Arc::new(buffer);
        let manager = ConnectionManager::new(config, transport.clone(), buffer.clone());
        let status = manager.status();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.run(shutdown.clone()));
        Harness {
            transport,
            peers,
            buffer,
            _sealed: sealed,
            status,
            shutdown,
            task,
        }
    }

    async fn wait_for(status: &mut watch::Receiver<SessionStatus>, f: impl Fn(&SessionStatus) -> bool) {
        status.wait_for(|s| f(s)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_in_order_and_buffers_updates() {
        let mut h = start(&config(&["BTC", "ETH"]));
        let mut peer = h.peers.recv().await.unwrap();

        let first = peer.next_sent().await.unwrap();
        let second = peer.next_sent().await.unwrap();
        assert!(first.contains(r#""coin":"BTC""#));
        assert!(second.contains(r#""coin":"ETH""#));

        peer.push(BOOK);
        peer.push("not json");
        peer.push(ack("BTC"));
        peer.push(ack("ETH"));
        wait_for(&mut h.status, |s| s.is_ready()).await;

        assert_eq!(h.buffer.len(), 1);
        let status = *h.status.borrow();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.sessions, 1);

        h.shutdown.cancel();
        let stopped = h.task.await.unwrap();
        assert!(stopped.has_session());
        assert_eq!(h.status.borrow().state, ConnectionState::ShuttingDown);
        stopped.close().await;
        assert_eq!(h.status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_acks_time_out_into_ready() {
        let mut h = start(&config(&["BTC"]));
        let _peer = h.peers.recv().await.unwrap();

        wait_for(&mut h.status, |s| s.state == ConnectionState::Connected).await;
        assert!(!h.status.borrow().subscriptions_ready);

        wait_for(&mut h.status, |s| s.is_ready()).await;
        assert_eq!(h.transport.attempts(), 1);

        h.shutdown.cancel();
        h.task.await.unwrap().close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_being_sent() {
        let mut h = start(&config(&["BTC"]));
        let mut peer = h.peers.recv().await.unwrap();
        assert!(peer.next_sent().await.unwrap().contains("subscribe"));

        let ping = peer.next_sent().await.unwrap();
        assert_eq!(ping, ping_request());

        h.shutdown.cancel();
        h.task.await.unwrap().close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_keepalives_hold_off_staleness() {
        let mut h = start(&config(&["BTC"]));
        let peer = h.peers.recv().await.unwrap();
        wait_for(&mut h.status, |s| s.state == ConnectionState::Connected).await;

        // No data frame for 300s, only transport pings every 60s.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            assert!(peer.push_keepalive());
        }

        let status = *h.status.borrow();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.sessions, 1);
        assert_eq!(h.transport.attempts(), 1);

        h.shutdown.cancel();
        h.task.await.unwrap().close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_back_off_then_recover() {
        let cfg = config(&["BTC"]);
        let (transport, mut peers) = ChannelTransport::new();
        transport.refuse_next(3);
        let transport = Arc::new(transport);
        let (buffer, _sealed) = IngestBuffer::new(10, 4);
        let manager = ConnectionManager::new(&cfg, transport.clone(), Arc::new(buffer));
        let mut status = manager.status();
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let task = tokio::spawn(manager.run(shutdown.clone()));

        let _peer = peers.recv().await.unwrap();
        wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(transport.attempts(), 4);
        // 1s + 2s + 4s of backoff before the fourth attempt
        assert!(started.elapsed() >= Duration::from_secs(7));

        shutdown.cancel();
        task.await.unwrap().close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect_and_resubscribe() {
        let mut h = start(&config(&["BTC"]));
        let mut peer = h.peers.recv().await.unwrap();
        assert!(peer.next_sent().await.unwrap().contains("subscribe"));
        drop(peer);

        let mut peer = h.peers.recv().await.unwrap();
        assert!(peer.next_sent().await.unwrap().contains(r#""coin":"BTC""#));
        wait_for(&mut h.status, |s| s.sessions == 2).await;
        assert_eq!(h.transport.attempts(), 2);

        h.shutdown.cancel();
        h.task.await.unwrap().close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let cfg = config(&["BTC"]);
        let (transport, _peers) = ChannelTransport::new();
        transport.refuse_next(u32::MAX);
        let (buffer, _sealed) = IngestBuffer::new(10, 4);
        let manager = ConnectionManager::new(&cfg, Arc::new(transport), Arc::new(buffer));
        let mut status = manager.status();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.run(shutdown.clone()));

        wait_for(&mut status, |s| s.state == ConnectionState::Reconnecting).await;
        shutdown.cancel();
        let stopped = task.await.unwrap();
        assert!(!stopped.has_session());
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::ShuttingDown.to_string(), "shutting_down");
        assert!(!SessionStatus::default().is_ready());
    }
}
