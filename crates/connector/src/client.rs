//! Book sync client: the ingestion loop tying session, decoder and
//! reconciler together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use polybook_metadata::SyncConfig;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::decoder::decode;
use crate::error::{ConnectionError, DesyncError, PermanentRejection, SyncError};
use crate::metrics::SyncMetrics;
use crate::polymarket::websocket::WsTransport;
use crate::reconciler::{Applied, Reconciler};
use crate::registry::{OutboundCommand, SubscriptionRegistry};
use crate::session::{ConnectOutcome, Session};
use crate::store::BookStore;
use crate::traits::Transport;
use crate::types::{AssetId, ConnectionState, TradeTick};

/// Notifications for observers. Delivery is best effort: when the channel
/// is full the event is dropped and counted, ingestion never waits.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected { reason: String },
    Trade(TradeTick),
    Desync(DesyncError),
    Rejected(PermanentRejection),
}

/// Point-in-time summary for logs and the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub assets_registered: usize,
    pub assets_confirmed: usize,
    pub books: usize,
    pub books_stale: usize,
}

impl SyncStatus {
    pub fn collect(
        state: ConnectionState,
        registry: &SubscriptionRegistry,
        store: &BookStore,
        stale_after: Duration,
    ) -> Self {
        Self {
            state,
            assets_registered: registry.len(),
            assets_confirmed: registry.confirmed_count(),
            books: store.len(),
            books_stale: store.stale_assets(stale_after, Utc::now()).len(),
        }
    }
}

pub struct BookSyncClient<T: Transport> {
    session: Session<T>,
    reconciler: Reconciler,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<BookStore>,
    metrics: Arc<SyncMetrics>,
    commands: mpsc::UnboundedReceiver<OutboundCommand>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    ping_interval: Duration,
    sweep_interval: Duration,
    confirm_timeout: Duration,
    max_resubscribe_attempts: u32,
    stale_after: Duration,
}

impl BookSyncClient<WsTransport> {
    /// Client over the live WebSocket feed, with its own metrics registry.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new()?);
        Ok(Self::new(
            WsTransport::from_config(&config.websocket),
            config,
            metrics,
        ))
    }
}

impl<T: Transport> BookSyncClient<T> {
    /// Builds a client and registers the configured static assets.
    pub fn new(transport: T, config: &SyncConfig, metrics: Arc<SyncMetrics>) -> Self {
        let store = Arc::new(BookStore::new());
        let (registry, commands) = SubscriptionRegistry::new(store.clone());
        let registry = Arc::new(registry);
        registry.add_assets(config.assets.iter().map(|id| AssetId::from(id.as_str())));

        let session = Session::new(
            transport,
            registry.clone(),
            metrics.clone(),
            Backoff::from_config(&config.backoff),
        )
        .with_max_assets(config.websocket.max_assets_per_connection)
        .with_read_timeout(config.websocket.read_timeout());
        let reconciler = Reconciler::new(
            store.clone(),
            registry.clone(),
            metrics.clone(),
            config.reconcile.fingerprint_policy,
        );
        let (events_tx, events_rx) = mpsc::channel(config.reconcile.event_buffer.max(1));
        let confirm_timeout = config.reconcile.confirm_timeout();

        Self {
            session,
            reconciler,
            registry,
            store,
            metrics,
            commands,
            events_tx,
            events_rx: Some(events_rx),
            ping_interval: config.websocket.ping_interval().max(Duration::from_millis(1)),
            sweep_interval: (confirm_timeout / 3).max(Duration::from_secs(1)),
            confirm_timeout,
            max_resubscribe_attempts: config.reconcile.max_resubscribe_attempts,
            stale_after: config.reconcile.stale_after(),
        }
    }

    pub fn store(&self) -> Arc<BookStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state_handle(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_handle()
    }

    /// Takes the observer event receiver. Only the first call returns it.
    pub fn events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.take()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::collect(
            self.session.state(),
            &self.registry,
            &self.store,
            self.stale_after,
        )
    }

    /// Runs until shutdown is signalled. Connection failures are retried
    /// forever; books stay readable from the store throughout and after.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            assets = self.registry.len(),
            policy = ?self.reconciler.policy(),
            "book sync starting"
        );

        loop {
            match self
                .session
                .connect_with_backoff(&mut shutdown, &mut self.commands)
                .await
            {
                ConnectOutcome::Shutdown => break,
                ConnectOutcome::Connected => self.emit(SyncEvent::Connected),
            }

            match self.pump(&mut shutdown).await {
                None => break,
                Some(reason) => {
                    warn!(reason = %reason, "session lost, reconnecting");
                    self.emit(SyncEvent::Disconnected { reason });
                }
            }
        }

        self.session.close().await;
        let status = self.status();
        info!(
            books = status.books,
            registered = status.assets_registered,
            "book sync stopped"
        );
    }

    /// Services one connected session. Returns `None` on shutdown, or the
    /// reason the session was lost. The read deadline is only pushed out by
    /// inbound frames, so pings and commands cannot keep a dead feed alive.
    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<String> {
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let read_deadline = self.session.read_deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received");
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(read_deadline) => {
                    let read_timeout = self.session.read_timeout();
                    warn!(timeout_secs = read_timeout.as_secs(), "market feed read timeout");
                    self.session.mark_lost();
                    return Some(ConnectionError::ReadTimeout(read_timeout).to_string());
                }
                Some(command) = self.commands.recv() => {
                    if let Err(e) = self.session.send_command(command).await {
                        self.session.mark_lost();
                        return Some(format!("send failed: {}", e));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.session.ping().await {
                        return Some(format!("ping failed: {}", e));
                    }
                }
                _ = sweep.tick() => self.sweep(),
                frame = self.session.receive() => match frame {
                    Ok(frame) => {
                        self.handle_frame(&frame);
                    }
                    Err(e) => return Some(e.to_string()),
                },
            }
        }
    }

    /// Decodes and applies one frame. Returns how many events were applied.
    /// An undecodable frame is counted and skipped as a whole.
    pub fn handle_frame(&mut self, frame: &str) -> usize {
        let events = match decode(frame) {
            Ok(events) => events,
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(error = %e, "skipping undecodable frame");
                return 0;
            }
        };

        let count = events.len();
        for event in events {
            self.metrics.events.with_label_values(&[event.kind()]).inc();
            match self.reconciler.apply(event) {
                Ok(Applied::Trade(trade)) => self.emit(SyncEvent::Trade(trade)),
                Ok(Applied::Rejected(rejection)) => self.emit(SyncEvent::Rejected(rejection)),
                Ok(applied) => trace!(?applied, "event applied"),
                Err(desync) => self.emit(SyncEvent::Desync(desync)),
            }
        }
        count
    }

    fn sweep(&mut self) {
        let rejected = self.reconciler.sweep_unconfirmed(
            self.confirm_timeout,
            self.max_resubscribe_attempts,
            Utc::now(),
        );
        for rejection in rejected {
            self.emit(SyncEvent::Rejected(rejection));
        }

        let status = self.status();
        self.metrics.assets_registered.set(status.assets_registered as i64);
        self.metrics.assets_confirmed.set(status.assets_confirmed as i64);
        self.metrics.books_stale.set(status.books_stale as i64);
    }

    fn emit(&self, event: SyncEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.metrics.events_dropped.inc();
                debug!(event = ?dropped, "event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
