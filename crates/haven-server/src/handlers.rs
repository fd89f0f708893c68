//! Connection handlers for the Haven server.
//!
//! Every WebSocket connection gets a read/write task that frames events;
//! all broker state lives on one task (`broker_loop`) that processes
//! commands and sweep ticks strictly one at a time. That task is the
//! single thread of execution the broker's atomicity rests on.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use haven_core::{Broker, BrokerConfig, EventSender};
use haven_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A command for the broker task.
pub enum BrokerCommand {
    /// A connection opened; register its delivery channel.
    Open {
        connection_id: String,
        sender: EventSender,
    },
    /// An inbound event from a connection.
    Inbound {
        connection_id: String,
        event: ClientEvent,
    },
    /// A connection closed.
    Closed { connection_id: String },
}

/// Shared server state.
pub struct AppState {
    /// Command channel into the broker task.
    pub commands: mpsc::UnboundedSender<BrokerCommand>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // The broker task: started exactly once, independent of any connection
    let (commands, command_rx) = mpsc::unbounded_channel();
    let broker = Broker::with_config(BrokerConfig {
        stale_after: Duration::from_millis(config.liveness.stale_after_ms),
    });
    tokio::spawn(broker_loop(
        broker,
        command_rx,
        Duration::from_millis(config.liveness.sweep_interval_ms),
    ));

    let state = Arc::new(AppState {
        commands,
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Haven broker listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// The broker task: one command or one sweep tick at a time, each
/// processed to completion. The sweep can never overlap an event handler.
async fn broker_loop(
    mut broker: Broker,
    mut commands: mpsc::UnboundedReceiver<BrokerCommand>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(BrokerCommand::Open { connection_id, sender }) => {
                        broker.connection_opened(connection_id, sender);
                    }
                    Some(BrokerCommand::Inbound { connection_id, event }) => {
                        broker.handle_event(&connection_id, event);
                    }
                    Some(BrokerCommand::Closed { connection_id }) => {
                        broker.connection_closed(&connection_id);
                    }
                    None => {
                        info!("Command channel closed, broker task exiting");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                broker.sweep();
            }
        }

        metrics::update_broker_gauges(&broker.stats());
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    // Register the delivery channel with the broker
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    if state
        .commands
        .send(BrokerCommand::Open {
            connection_id: connection_id.clone(),
            sender: events_tx,
        })
        .is_err()
    {
        error!(connection = %connection_id, "Broker task is gone");
        return;
    }

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Deliver broker events to the peer
            event = events_rx.recv() => {
                let Some(event) = event else {
                    // The broker dropped this connection's channel
                    break;
                };
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_event(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Event encoding error");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_event(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if !decode_inbound(&mut read_buffer, &connection_id, &state) {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());

                        if !decode_inbound(&mut read_buffer, &connection_id, &state) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: the broker routes the close into every component
    let _ = state.commands.send(BrokerCommand::Closed {
        connection_id: connection_id.clone(),
    });

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode buffered frames and forward them to the broker task.
///
/// Returns `false` when the broker task is gone and the connection should
/// shut down.
fn decode_inbound(read_buffer: &mut BytesMut, connection_id: &str, state: &Arc<AppState>) -> bool {
    loop {
        match codec::decode_from::<ClientEvent>(read_buffer) {
            Ok(Some(event)) => {
                if state
                    .commands
                    .send(BrokerCommand::Inbound {
                        connection_id: connection_id.to_string(),
                        event,
                    })
                    .is_err()
                {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                // Malformed input from this peer; drop the buffer, keep
                // the connection
                warn!(connection = %connection_id, error = %e, "Frame decoding error");
                metrics::record_error("protocol");
                read_buffer.clear();
                return true;
            }
        }
    }
}
