//! WebSocket replay server
//!
//! Owns the warp HTTP/WebSocket surface, the per-connection subscriber
//! tasks, the heartbeat task, and the replay task. The HTTP side keeps
//! serving new subscribers after the replay sequence is exhausted; late
//! joiners simply receive nothing (no backfill).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warp::ws::Message;
use warp::Filter;

use crate::batch::Record;
use crate::config::ReplayConfig;
use crate::error::{ReplayError, Result};
use crate::replay::{ReplayEngine, WireMessage};
use crate::subscriber::{Subscriber, SubscriberRegistry};

pub struct ReplayServer {
    config: ReplayConfig,
    registry: Arc<SubscriberRegistry>,
    shutdown: CancellationToken,
}

impl ReplayServer {
    pub fn new(config: ReplayConfig, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(SubscriberRegistry::new(config.max_subscribers));
        Self {
            config,
            registry,
            shutdown,
        }
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        self.registry.clone()
    }

    /// Serve subscribers and replay the record sequence once.
    pub async fn start(&self, records: Vec<Record>) -> Result<()> {
        info!("starting trade replay server");

        let engine = ReplayEngine::new(
            self.registry.clone(),
            self.config.speed_factor,
            self.config.min_delay(),
            self.shutdown.clone(),
        );
        // The replay finishing normally must not take the server down: new
        // subscribers can still connect, they just receive nothing. An
        // invariant violation is fatal, so it cancels the shutdown token.
        let replay_shutdown = self.shutdown.clone();
        let replay_handle = tokio::spawn(async move {
            let result = engine.run(records).await;
            if let Err(e) = &result {
                error!("replay aborted: {e}");
                replay_shutdown.cancel();
            }
            result
        });

        let heartbeat_handle = self.spawn_heartbeat_task();
        let server_handle = self.spawn_websocket_server()?;

        info!("trade replay server started");

        tokio::select! {
            result = server_handle => {
                if let Err(e) = result {
                    error!("websocket server task failed: {e}");
                }
            }
            result = heartbeat_handle => {
                if let Err(e) = result {
                    error!("heartbeat task failed: {e}");
                }
            }
        }

        // Both long-lived tasks only stop once shutdown fires; if the replay
        // aborted and triggered it, surface that error to the caller.
        if replay_handle.is_finished() {
            if let Ok(Err(e)) = replay_handle.await {
                return Err(e);
            }
        }

        Ok(())
    }

    fn spawn_websocket_server(&self) -> Result<tokio::task::JoinHandle<()>> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| ReplayError::Configuration {
                message: format!("invalid bind address: {e}"),
            })?;

        info!("listening on {addr}");

        let registry = self.registry.clone();
        let enable_cors = self.config.enable_cors;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let ws_registry = registry.clone();
            let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
                let registry = ws_registry.clone();
                ws.on_upgrade(move |socket| handle_connection(registry, socket))
            });

            let health_route = warp::path("health")
                .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

            let status_registry = registry.clone();
            let status_route = warp::path("status").and_then(move || {
                let registry = status_registry.clone();
                async move {
                    Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                        "status": "running",
                        "service": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                        "subscribers": registry.count().await,
                    })))
                }
            });

            let routes = ws_route.or(health_route).or(status_route);

            if enable_cors {
                let (_, server) = warp::serve(routes.with(warp::cors().allow_any_origin()))
                    .bind_with_graceful_shutdown(addr, shutdown.cancelled_owned());
                server.await;
            } else {
                let (_, server) =
                    warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown.cancelled_owned());
                server.await;
            }
        });

        Ok(handle)
    }

    fn spawn_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let interval_secs = self.config.heartbeat_interval_secs;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if interval_secs == 0 {
                shutdown.cancelled().await;
                return;
            }

            let mut ticker = interval(Duration::from_secs(interval_secs));
            ticker.tick().await; // the immediate first tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let subscribers = registry.count().await;
                match serde_json::to_string(&WireMessage::info(subscribers)) {
                    Ok(message) => {
                        registry.broadcast(&message).await;
                        debug!(subscribers, "sent heartbeat");
                    }
                    Err(e) => error!("failed to serialize heartbeat: {e}"),
                }
            }
        })
    }
}

async fn handle_connection(registry: Arc<SubscriberRegistry>, ws: warp::ws::WebSocket) {
    if let Err(e) = serve_subscriber(registry, ws).await {
        warn!("subscriber connection error: {e}");
    }
}

/// Owns one subscriber lifecycle: register, pump outbound messages into the
/// socket, watch the inbound side for liveness, deregister.
async fn serve_subscriber(registry: Arc<SubscriberRegistry>, ws: warp::ws::WebSocket) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriber = Subscriber::new(tx);
    let id = subscriber.id;

    // Returning drops the socket, which rejects the connection when the
    // registry is full.
    registry.add(subscriber).await?;

    let (mut ws_sender, mut ws_receiver) = ws.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = ws_sender.send(Message::text(text)).await {
                            debug!(%id, "write failed, dropping subscriber: {e}");
                            break;
                        }
                    }
                    // Evicted by a failed broadcast pass.
                    None => break,
                }
            }

            // Inbound frames are only a liveness signal; payloads are ignored.
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(msg)) if msg.is_close() => {
                        info!(%id, "subscriber sent close");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%id, "read failed: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    registry.remove(id).await;
    Ok(())
}
