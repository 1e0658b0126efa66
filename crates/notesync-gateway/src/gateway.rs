//! Gateway main structure
//!
//! The WebSocket server: accepts connections, checks their origin, then runs
//! one reader loop and one writer task per connection.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use notesync_config::GatewayConfig;
use notesync_observability::logging::connection_span;
use notesync_observability::GatewayMetrics;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async};
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::angular::AngularBridge;
use crate::connection::ConnectionHandle;
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::events::BackendEvents;
use crate::fanout::Fanout;
use crate::pool::TaskPool;
use crate::protocol::OutboundMessage;
use crate::registry::ConnectionRegistry;
use crate::services::Services;
use crate::session::{SessionGate, TicketStore};

/// The notebook sync server
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    gate: Arc<SessionGate>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<Fanout>,
    dispatcher: Dispatcher,
    events: BackendEvents,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig, services: Services) -> Self {
        Self::with_tickets(config, services, Arc::new(TicketStore::new()))
    }

    /// Share a ticket store with the login endpoint that issues tickets
    pub fn with_tickets(config: GatewayConfig, services: Services, tickets: Arc<TicketStore>) -> Self {
        let config = Arc::new(config);
        let gate = Arc::new(SessionGate::new(&config, tickets));
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(Arc::clone(&registry), config.collaborative_mode));
        let angular = Arc::new(AngularBridge::new(Arc::clone(&fanout), services.clone()));
        let pool = TaskPool::new(config.worker_pool_size);

        let events = BackendEvents::new(
            Arc::clone(&fanout),
            Arc::clone(&angular),
            services.clone(),
            pool.clone(),
            config.paragraph_status_progress,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&gate),
            Arc::clone(&registry),
            Arc::clone(&fanout),
            angular,
            services,
            pool,
        );

        Self {
            config,
            gate,
            registry,
            fanout,
            dispatcher,
            events,
        }
    }

    pub fn tickets(&self) -> &Arc<TicketStore> {
        self.gate.tickets()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Callbacks for execution backends
    pub fn events(&self) -> &BackendEvents {
        &self.events
    }

    /// Users with at least one open connection
    pub fn connected_users(&self) -> BTreeSet<String> {
        self.registry.connected_users()
    }

    pub fn send_notice(&self, notice: &str) {
        self.events.notice(notice);
    }

    /// Bind the configured address and serve until an accept fails
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Gateway listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "new connection");

            if self.registry.count() >= self.config.max_connections {
                warn!(peer = %peer, "connection limit reached, rejecting");
                GatewayMetrics::rejected("capacity");
                tokio::spawn(async move {
                    if let Err(e) = reject_connection(stream, "Server at capacity").await {
                        debug!(peer = %peer, error = %e, "failed to send rejection");
                    }
                });
                continue;
            }

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, peer).await {
                    warn!(peer = %peer, error = %e, "connection error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut headers = HashMap::new();
        let mut origin_rejected = false;
        let gate = Arc::clone(&self.gate);
        let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            for (name, value) in request.headers() {
                if let Ok(value) = value.to_str() {
                    headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
                }
            }
            let origin = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
            if gate.check_origin(origin) {
                return Ok(response);
            }
            origin_rejected = true;
            let mut rejection = ErrorResponse::new(Some("Origin not allowed".to_string()));
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            Err(rejection)
        };

        let handshake = accept_hdr_async(stream, callback).await;
        let ws_stream = match handshake {
            Ok(ws_stream) => ws_stream,
            Err(_) if origin_rejected => {
                warn!(peer = %peer, "origin not allowed, handshake refused");
                GatewayMetrics::rejected("origin");
                return Ok(());
            }
            Err(e) => return Err(GatewayError::WebSocket(e)),
        };

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<String>>();
        let conn = Arc::new(ConnectionHandle::new(
            Uuid::new_v4().to_string(),
            Some(peer),
            headers,
            tx,
        ));

        let heartbeat = self.config.heartbeat_interval_secs;
        let writer_id = conn.id.clone();
        let writer = tokio::spawn(async move {
            let period = Duration::from_secs(heartbeat.max(1));
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(Message::Text(frame.as_str().to_owned())).await {
                            debug!(connection_id = %writer_id, error = %e, "write failed");
                            break;
                        }
                    }
                    _ = ticker.tick(), if heartbeat > 0 => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        self.dispatcher.on_open(&conn);
        let span = connection_span(&conn.id, Some(&peer.to_string()));
        async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        trace!(frame = %text, "frame received");
                        self.dispatcher.on_message(&conn, &text).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => debug!("ignoring binary frame"),
                    // pongs are queued by tungstenite itself
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        debug!(error = %e, "read failed");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await;

        self.dispatcher.on_close(&conn);
        writer.abort();
        Ok(())
    }
}

/// Complete the handshake only to tell the client why it is refused
async fn reject_connection(stream: TcpStream, reason: &str) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut sink, _) = ws_stream.split();
    let frame = OutboundMessage::error_info(reason).encode()?;
    sink.send(Message::Text(frame)).await?;
    sink.close().await?;
    Ok(())
}
