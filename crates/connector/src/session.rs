//! Connection session: owns the transport, drives reconnects with backoff,
//! and replays the subscription registry onto every fresh connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::ConnectionError;
use crate::metrics::SyncMetrics;
use crate::registry::{OutboundCommand, SubscriptionRegistry};
use crate::traits::Transport;
use crate::types::{AssetId, ConnectionState, SubscriptionRequest};

/// Server reply to the application-level "PING".
const KEEPALIVE_REPLY: &str = "PONG";

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Shutdown,
}

pub struct Session<T: Transport> {
    transport: T,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<SyncMetrics>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    /// The channel-opening subscription has gone out on this connection.
    subscribed: bool,
    max_assets_per_connection: usize,
    read_timeout: Duration,
    /// Last inbound frame on this connection, keepalive replies included.
    last_frame: Instant,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<SyncMetrics>,
        backoff: Backoff,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            registry,
            metrics,
            backoff,
            state,
            subscribed: false,
            max_assets_per_connection: usize::MAX,
            read_timeout: DEFAULT_READ_TIMEOUT,
            last_frame: Instant::now(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// The connection counts as dead if nothing arrives before this instant.
    pub fn read_deadline(&self) -> Instant {
        self.last_frame
            .checked_add(self.read_timeout)
            .unwrap_or_else(|| self.last_frame + FAR_FUTURE)
    }

    /// Warn when the subscription set grows past what one connection should carry.
    pub fn with_max_assets(mut self, max: usize) -> Self {
        self.max_assets_per_connection = max;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_handle(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connects, retrying with backoff until it succeeds or shutdown is
    /// signalled. On success the full registry has been subscribed.
    ///
    /// Commands queued while disconnected are discarded: the full
    /// subscription sent here already reflects the registry.
    pub async fn connect_with_backoff(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        commands: &mut mpsc::UnboundedReceiver<OutboundCommand>,
    ) -> ConnectOutcome {
        loop {
            if *shutdown.borrow() {
                return ConnectOutcome::Shutdown;
            }

            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                result = self.transport.connect() => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return ConnectOutcome::Shutdown;
                    }
                    continue;
                }
            };

            match attempt {
                Ok(()) => match self.subscribe_all(commands).await {
                    Ok(count) => {
                        self.backoff.reset();
                        self.last_frame = Instant::now();
                        self.set_state(ConnectionState::Connected);
                        info!(assets = count, "session established");
                        return ConnectOutcome::Connected;
                    }
                    Err(e) => {
                        warn!(error = %e, "subscription failed on fresh connection");
                        self.invalidate();
                    }
                },
                Err(e) => {
                    warn!(error = %e, attempt = self.backoff.attempts() + 1, "connect failed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            self.metrics.reconnect_attempts.inc();
            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "retrying connection");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return ConnectOutcome::Shutdown;
                    }
                }
            }
        }
    }

    /// Sends the full registry as the channel-opening subscription.
    async fn subscribe_all(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<OutboundCommand>,
    ) -> Result<usize, ConnectionError> {
        self.set_state(ConnectionState::Resubscribing);
        self.registry.clear_confirmations();
        self.subscribed = false;

        let mut discarded = 0usize;
        while commands.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "dropped commands queued while disconnected");
        }

        let assets = self.registry.assets_needing_subscription();
        self.metrics.assets_registered.set(assets.len() as i64);
        if assets.is_empty() {
            debug!("registry empty, deferring subscription");
            return Ok(0);
        }
        if assets.len() > self.max_assets_per_connection {
            warn!(
                count = assets.len(),
                max = self.max_assets_per_connection,
                "subscribing more assets than one connection should carry"
            );
        }

        self.transport
            .send(&SubscriptionRequest::Initial(assets.clone()))
            .await?;
        self.subscribed = true;
        self.registry.mark_requested(&assets);
        Ok(assets.len())
    }

    /// Forwards a registry command. Commands are dropped while not connected.
    pub async fn send_command(&mut self, command: OutboundCommand) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            debug!(?command, "not connected, dropping command");
            return Ok(());
        }

        match command {
            OutboundCommand::Subscribe(assets) => {
                let assets: Vec<AssetId> = assets
                    .into_iter()
                    .filter(|a| self.registry.is_registered(a))
                    .collect();
                self.subscribe(assets).await?;
            }
            OutboundCommand::Unsubscribe(assets) => {
                let assets: Vec<AssetId> = assets
                    .into_iter()
                    .filter(|a| !self.registry.is_registered(a))
                    .collect();
                if assets.is_empty() || !self.subscribed {
                    return Ok(());
                }
                self.transport
                    .send(&SubscriptionRequest::Unsubscribe(assets))
                    .await?;
            }
            OutboundCommand::Resubscribe(asset) => {
                if !self.registry.is_registered(&asset) {
                    return Ok(());
                }
                if self.subscribed {
                    self.transport
                        .send(&SubscriptionRequest::Unsubscribe(vec![asset.clone()]))
                        .await?;
                }
                self.subscribe(vec![asset]).await?;
                self.metrics.resubscribes.inc();
            }
        }
        self.metrics.assets_registered.set(self.registry.len() as i64);
        Ok(())
    }

    async fn subscribe(&mut self, assets: Vec<AssetId>) -> Result<(), ConnectionError> {
        if assets.is_empty() {
            return Ok(());
        }
        let request = if self.subscribed {
            SubscriptionRequest::Subscribe(assets)
        } else {
            SubscriptionRequest::Initial(assets)
        };
        self.transport.send(&request).await?;
        self.subscribed = true;
        self.registry.mark_requested(request.assets());
        Ok(())
    }

    /// Next data frame. Keepalive replies only push the read deadline out.
    /// Any error means the session is lost and confirmations have been
    /// cleared. Cancel-safe.
    pub async fn receive(&mut self) -> Result<String, ConnectionError> {
        loop {
            match self.transport.receive().await {
                Ok(frame) => {
                    self.last_frame = Instant::now();
                    if frame.trim() == KEEPALIVE_REPLY {
                        trace!("keepalive acknowledged");
                        continue;
                    }
                    self.metrics.frames_received.inc();
                    return Ok(frame);
                }
                Err(e) => {
                    self.lost();
                    return Err(e);
                }
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        if let Err(e) = self.transport.ping().await {
            self.lost();
            return Err(e);
        }
        Ok(())
    }

    /// Marks the session lost after a send failure or read timeout in the
    /// ingestion loop.
    pub fn mark_lost(&mut self) {
        self.lost();
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "error closing transport");
        }
        self.subscribed = false;
        self.set_state(ConnectionState::Disconnected);
    }

    fn lost(&mut self) {
        if self.state() == ConnectionState::Connected {
            self.metrics.disconnects.inc();
        }
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.subscribed = false;
        self.registry.clear_confirmations();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.metrics.set_connection_state(state);
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BookStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        fail_connects: usize,
        connects: usize,
        sent: Vec<SubscriptionRequest>,
        frames: VecDeque<Result<String, ()>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&mut self) -> Result<(), ConnectionError> {
            self.connects += 1;
            if self.fail_connects > 0 {
                self.fail_connects -= 1;
                return Err(ConnectionError::ConnectFailed("refused".to_string()));
            }
            Ok(())
        }

        async fn send(&mut self, request: &SubscriptionRequest) -> Result<(), ConnectionError> {
            self.sent.push(request.clone());
            Ok(())
        }

        async fn receive(&mut self) -> Result<String, ConnectionError> {
            match self.frames.pop_front() {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(())) | None => Err(ConnectionError::Closed),
            }
        }

        async fn ping(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0, 0.0)
    }

    fn session(
        transport: RecordingTransport,
    ) -> (
        Session<RecordingTransport>,
        Arc<SubscriptionRegistry>,
        mpsc::UnboundedReceiver<OutboundCommand>,
    ) {
        let store = Arc::new(BookStore::new());
        let (registry, commands) = SubscriptionRegistry::new(store);
        let registry = Arc::new(registry);
        let metrics = Arc::new(SyncMetrics::new().unwrap());
        let session = Session::new(transport, registry.clone(), metrics, fast_backoff());
        (session, registry, commands)
    }

    #[tokio::test]
    async fn test_connect_retries_then_subscribes_registry() {
        let transport = RecordingTransport {
            fail_connects: 2,
            ..Default::default()
        };
        let (mut session, registry, mut commands) = session(transport);
        registry.add_assets(vec![AssetId::from("B"), AssetId::from("A")]);
        let (_tx, mut shutdown) = watch::channel(false);

        let outcome = session.connect_with_backoff(&mut shutdown, &mut commands).await;
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.transport().connects, 3);
        assert_eq!(
            session.transport().sent,
            vec![SubscriptionRequest::Initial(vec![
                AssetId::from("A"),
                AssetId::from("B")
            ])]
        );
        // the queued Subscribe from add_assets was superseded
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        let transport = RecordingTransport {
            fail_connects: usize::MAX,
            ..Default::default()
        };
        let (mut session, _registry, mut commands) = session(transport);
        let (tx, mut shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = session.connect_with_backoff(&mut shutdown, &mut commands).await;
        assert_eq!(outcome, ConnectOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_first_subscribe_on_empty_connection_uses_initial_form() {
        let (mut session, registry, mut commands) = session(RecordingTransport::default());
        let (_tx, mut shutdown) = watch::channel(false);
        session.connect_with_backoff(&mut shutdown, &mut commands).await;
        assert!(session.transport().sent.is_empty());

        registry.add_asset(AssetId::from("A"));
        let cmd = commands.try_recv().unwrap();
        session.send_command(cmd).await.unwrap();
        registry.add_asset(AssetId::from("B"));
        let cmd = commands.try_recv().unwrap();
        session.send_command(cmd).await.unwrap();

        assert_eq!(
            session.transport().sent,
            vec![
                SubscriptionRequest::Initial(vec![AssetId::from("A")]),
                SubscriptionRequest::Subscribe(vec![AssetId::from("B")]),
            ]
        );
    }

    #[tokio::test]
    async fn test_resubscribe_sends_unsubscribe_then_subscribe() {
        let (mut session, registry, mut commands) = session(RecordingTransport::default());
        registry.add_asset(AssetId::from("A"));
        let (_tx, mut shutdown) = watch::channel(false);
        session.connect_with_backoff(&mut shutdown, &mut commands).await;

        session
            .send_command(OutboundCommand::Resubscribe(AssetId::from("A")))
            .await
            .unwrap();
        assert_eq!(
            &session.transport().sent[1..],
            &[
                SubscriptionRequest::Unsubscribe(vec![AssetId::from("A")]),
                SubscriptionRequest::Subscribe(vec![AssetId::from("A")]),
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_error_clears_confirmations() {
        let transport = RecordingTransport {
            frames: VecDeque::from(vec![Ok("{}".to_string()), Err(())]),
            ..Default::default()
        };
        let (mut session, registry, mut commands) = session(transport);
        registry.add_asset(AssetId::from("A"));
        let (_tx, mut shutdown) = watch::channel(false);
        session.connect_with_backoff(&mut shutdown, &mut commands).await;
        registry.confirm(&AssetId::from("A"));

        assert!(session.receive().await.is_ok());
        assert!(session.receive().await.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(registry.confirmed_count(), 0);

        // commands are not forwarded while disconnected
        session
            .send_command(OutboundCommand::Subscribe(vec![AssetId::from("A")]))
            .await
            .unwrap();
        assert_eq!(session.transport().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_reply_refreshes_read_deadline() {
        let transport = RecordingTransport {
            frames: VecDeque::from(vec![Ok("PONG".to_string()), Ok("[]".to_string())]),
            ..Default::default()
        };
        let (session, registry, mut commands) = session(transport);
        let mut session = session.with_read_timeout(Duration::from_secs(5));
        registry.add_asset(AssetId::from("A"));
        let (_tx, mut shutdown) = watch::channel(false);
        session.connect_with_backoff(&mut shutdown, &mut commands).await;
        let connected_deadline = session.read_deadline();
        assert_eq!(session.read_timeout(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.receive().await.unwrap(), "[]");
        assert!(session.read_deadline() > connected_deadline);
        assert_eq!(session.metrics.frames_received.get(), 1);
    }
}
