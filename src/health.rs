use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub current_balance: Decimal,
    pub available_balance: Decimal,
    pub open_positions: usize,
    pub breaker_active: bool,
    pub breaker_reasons: Vec<String>,
    pub stream_connected: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            current_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            open_positions: 0,
            breaker_active: false,
            breaker_reasons: vec![],
            stream_connected: false,
        }
    }
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// `/healthz` (liveness) and `/status` (read-only Account/breaker/stream
/// snapshot) per §6's control surface. Mutates nothing; the executor task
/// pushes fresh snapshots in, this only serves them out.
pub struct HealthServer {
    status: SharedStatus,
}

impl HealthServer {
    pub fn new() -> Self {
        Self { status: Arc::new(RwLock::new(StatusSnapshot::default())) }
    }

    pub fn status_handle(&self) -> SharedStatus {
        self.status.clone()
    }

    pub async fn serve(&self, port: u16) {
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/status", get(status))
            .with_state(self.status.clone());

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    log::error!("health server exited: {}", e);
                }
            }
            Err(e) => {
                log::error!("health server failed to bind {}: {}", addr, e);
            }
        }
    }
}

impl Default for HealthServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    Json(status.read().await.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_handle_reflects_writes() {
        let server = HealthServer::new();
        let handle = server.status_handle();
        {
            let mut guard = handle.write().await;
            guard.current_balance = rust_decimal_macros::dec!(1000);
            guard.open_positions = 2;
        }
        let snapshot = server.status_handle().read().await.clone();
        assert_eq!(snapshot.open_positions, 2);
    }

    #[test]
    fn default_snapshot_has_no_open_positions() {
        let snapshot = StatusSnapshot::default();
        assert_eq!(snapshot.open_positions, 0);
        assert!(!snapshot.breaker_active);
    }
}
