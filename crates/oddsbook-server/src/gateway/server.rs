//! The WebSocket server behind the realtime gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use oddsbook_common::MarketSnapshot;

use crate::bus::{MarketNotice, SharedFanoutBus};
use crate::cache::SharedMarketCache;
use crate::config::GatewayConfig;
use crate::gateway::registry::{ClientSession, ConnectionRegistry};
use crate::gateway::{ClientEvent, PushEvent, SourceTag};
use crate::state::SharedCounters;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Shared reference to the gateway.
pub type SharedGatewayServer = Arc<GatewayServer>;

/// WebSocket server pushing market snapshots to every connected client.
pub struct GatewayServer {
    config: GatewayConfig,
    cache: SharedMarketCache,
    bus: SharedFanoutBus,
    registry: Arc<ConnectionRegistry>,
    counters: SharedCounters,
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        cache: SharedMarketCache,
        bus: SharedFanoutBus,
        counters: SharedCounters,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            cache,
            bus,
            registry: Arc::new(ConnectionRegistry::new()),
            counters,
            shutdown_tx,
        }
    }

    pub fn new_shared(
        config: GatewayConfig,
        cache: SharedMarketCache,
        bus: SharedFanoutBus,
        counters: SharedCounters,
    ) -> SharedGatewayServer {
        Arc::new(Self::new(config, cache, bus, counters))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sender for triggering graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accepts connections until shutdown.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Gateway shutting down");
                    break;
                }
            }
        }

        for session in self.registry.sessions().await {
            session.send(Message::Close(None));
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.registry.len().await >= self.config.max_clients {
            warn!(
                addr = %addr,
                max = self.config.max_clients,
                "Rejecting connection, gateway at capacity"
            );
            return;
        }

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(addr = %addr, error = %err, "WebSocket handshake failed");
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Nothing is pushed until the client says who it is.
        let hello = tokio::time::timeout(self.config.hello_timeout(), read_hello(&mut ws_rx)).await;
        let (user_id, role) = match hello {
            Ok(Some(ClientEvent::Hello { user_id, role })) => (user_id, role),
            Ok(None) => {
                debug!(addr = %addr, "Connection closed before hello");
                return;
            }
            Err(_) => {
                warn!(addr = %addr, "No hello within timeout, dropping connection");
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let (session, superseded) = self.registry.register(user_id, role, tx.clone()).await;
        self.counters.client_connected();
        info!(
            conn_id = session.conn_id,
            user_id = %session.user_id,
            role = %session.role,
            addr = %addr,
            "Client connected"
        );

        if let Some(old) = superseded {
            self.supersede(old);
        }

        // Connect-time catalog, so a fresh client renders without waiting
        // for the first notice.
        for snapshot in self.cache.scan() {
            send_event(&tx, &PushEvent::market_update(&snapshot, SourceTag::Resync));
        }

        self.client_task(session, ws_tx, ws_rx, rx).await;
    }

    /// Tells the old session it lost to a newer connection, then force
    /// closes it after the grace period.
    fn supersede(&self, old: ClientSession) {
        self.counters
            .sessions_superseded
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            conn_id = old.conn_id,
            user_id = %old.user_id,
            "Session superseded by a newer connection"
        );
        if let Ok(json) = serde_json::to_string(&PushEvent::session_superseded(&old.user_id)) {
            old.send(Message::Text(json));
        }
        let grace = self.config.supersede_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            old.send(Message::Close(None));
        });
    }

    /// Pump for one client: forwards queued events out, answers pings,
    /// and exits on close, error, or shutdown.
    async fn client_task(
        &self,
        session: ClientSession,
        mut ws_tx: WsSink,
        mut ws_rx: WsSource,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let conn_id = session.conn_id;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(err) = ws_tx.send(message).await {
                        debug!(conn_id, error = %err, "Failed to send frame");
                        break;
                    }
                    if closing {
                        debug!(conn_id, "Server closed connection");
                        break;
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Ping(data))) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!(conn_id, "Client requested close");
                            break;
                        }
                        Some(Err(err)) => {
                            debug!(conn_id, error = %err, "WebSocket error");
                            break;
                        }
                        None => {
                            debug!(conn_id, "Connection closed");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.registry.remove(conn_id).await;
        self.counters.client_disconnected();
        info!(conn_id, user_id = %session.user_id, "Client disconnected");
    }

    /// Notice consumer: re-read the cache for the referenced market and
    /// push a full snapshot to every session. Deliberately no per-market
    /// filtering on this path.
    fn spawn_notice_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut notices = self.bus.subscribe();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    notice = notices.recv() => {
                        match notice {
                            Ok(notice) => self.push_market(&notice).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Notice stream lagged, resync will reconcile");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Full-catalog broadcast on a fixed period, bounding the staleness
    /// window even when notices are dropped.
    fn spawn_resync_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.resync_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate tick; clients get a catalog on connect.
            ticker.tick().await;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.resync().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn push_market(&self, notice: &MarketNotice) {
        let snapshot = match self.cache.get(notice.kind, &notice.market_id) {
            Some(snapshot) => snapshot,
            None => {
                debug!(market_id = %notice.market_id, "Noticed market missing from cache");
                return;
            }
        };
        self.push_snapshot(&snapshot, SourceTag::Live).await;
    }

    /// Runs one reconciliation pass over every live cache entry.
    pub async fn resync(&self) {
        if self.registry.is_empty().await {
            return;
        }
        let snapshots = self.cache.scan();
        for snapshot in &snapshots {
            self.push_snapshot(snapshot, SourceTag::Resync).await;
        }
        self.counters.resyncs_run.fetch_add(1, Ordering::Relaxed);
        debug!(markets = snapshots.len(), "Resync broadcast complete");
    }

    async fn push_snapshot(&self, snapshot: &MarketSnapshot, source_tag: SourceTag) {
        let event = PushEvent::market_update(snapshot, source_tag);
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "Failed to serialize push event");
                return;
            }
        };
        let (delivered, failed) = self.registry.broadcast(&Message::Text(json)).await;
        if failed > 0 {
            debug!(delivered, failed, "Push delivery incomplete");
        }
    }
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, event: &PushEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = tx.send(Message::Text(json));
    }
}

/// Waits for the identifying hello frame, ignoring everything else.
/// `None` means the connection went away first.
async fn read_hello(ws_rx: &mut WsSource) -> Option<ClientEvent> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => return Some(event),
                Err(err) => {
                    debug!(error = %err, "Ignoring unparseable frame before hello");
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(_)) => return None,
            Some(Ok(_)) => {}
        }
    }
}

/// Binds the gateway and spawns its accept loop, notice consumer, and
/// resync task. Returns the bound address (port 0 resolves here) and the
/// accept task handle.
pub async fn spawn_gateway(
    server: SharedGatewayServer,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(&server.config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {}", server.config.bind_addr))?;
    let addr = listener.local_addr()?;
    info!(
        addr = %addr,
        resync_interval_secs = server.config.resync_interval_secs,
        max_clients = server.config.max_clients,
        "Realtime gateway listening"
    );

    Arc::clone(&server).spawn_notice_task();
    Arc::clone(&server).spawn_resync_task();
    let accept = tokio::spawn(server.accept_loop(listener));
    Ok((addr, accept))
}
