use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, warn};

use crate::config::AgentConfig;

/// Events that get an email (§7 User-visible surface): breaker trip,
/// stream disconnect past threshold, position opened, position closed,
/// daily summary. Delivery failure is logged and swallowed — never blocks
/// trading.
pub enum NotifyEvent {
    BreakerTripped { reason: String },
    StreamDisconnected { seconds: u64 },
    PositionOpened { ticker: String, entry_price: String, size: String },
    PositionClosed { ticker: String, realized_pnl: String, reason: String },
    DailySummary { daily_pnl: String, trades: u32, wins: u32, losses: u32 },
}

impl NotifyEvent {
    fn subject(&self) -> String {
        match self {
            NotifyEvent::BreakerTripped { .. } => "Circuit breaker tripped".to_string(),
            NotifyEvent::StreamDisconnected { .. } => "Stream disconnected".to_string(),
            NotifyEvent::PositionOpened { ticker, .. } => format!("Position opened: {}", ticker),
            NotifyEvent::PositionClosed { ticker, .. } => format!("Position closed: {}", ticker),
            NotifyEvent::DailySummary { .. } => "Daily summary".to_string(),
        }
    }

    fn body(&self) -> String {
        match self {
            NotifyEvent::BreakerTripped { reason } => format!("A circuit breaker tripped: {}", reason),
            NotifyEvent::StreamDisconnected { seconds } => format!("Stream has been silent for {}s", seconds),
            NotifyEvent::PositionOpened { ticker, entry_price, size } => {
                format!("Opened {} at {} for {}", ticker, entry_price, size)
            }
            NotifyEvent::PositionClosed { ticker, realized_pnl, reason } => {
                format!("Closed {}: pnl={} reason={}", ticker, realized_pnl, reason)
            }
            NotifyEvent::DailySummary { daily_pnl, trades, wins, losses } => {
                format!("Daily P&L {} over {} trades ({} wins, {} losses)", daily_pnl, trades, wins, losses)
            }
        }
    }
}

pub struct Notifier {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
    to: String,
}

impl Notifier {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        if cfg.smtp_host.is_empty() || cfg.smtp_to.is_empty() {
            return Self { transport: None, from: cfg.smtp_from.clone(), to: cfg.smtp_to.clone() };
        }
        let creds = Credentials::new(cfg.smtp_user.clone(), cfg.smtp_password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
            .ok()
            .map(|builder| builder.port(cfg.smtp_port).credentials(creds).build());
        Self { transport, from: cfg.smtp_from.clone(), to: cfg.smtp_to.clone() }
    }

    pub async fn notify(&self, event: NotifyEvent) {
        let Some(transport) = &self.transport else {
            return;
        };
        let from: Mailbox = match self.from.parse() {
            Ok(m) => m,
            Err(e) => {
                warn!("invalid smtp_from address: {}", e);
                return;
            }
        };
        let to: Mailbox = match self.to.parse() {
            Ok(m) => m,
            Err(e) => {
                warn!("invalid smtp_to address: {}", e);
                return;
            }
        };

        let message = match Message::builder().from(from).to(to).subject(event.subject()).body(event.body()) {
            Ok(m) => m,
            Err(e) => {
                warn!("failed building notification message: {}", e);
                return;
            }
        };

        if let Err(e) = transport.send(message).await {
            error!("failed sending notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_smtp_host_disables_transport() {
        let mut cfg = AgentConfig::default();
        cfg.smtp_host.clear();
        let notifier = Notifier::from_config(&cfg);
        assert!(notifier.transport.is_none());
    }

    #[tokio::test]
    async fn notify_without_transport_is_a_noop() {
        let cfg = AgentConfig::default();
        let notifier = Notifier::from_config(&cfg);
        notifier.notify(NotifyEvent::BreakerTripped { reason: "daily_loss_limit".into() }).await;
    }

    #[test]
    fn position_closed_body_includes_pnl_and_reason() {
        let event = NotifyEvent::PositionClosed { ticker: "T".into(), realized_pnl: "1.82".into(), reason: "TAKE_PROFIT".into() };
        assert!(event.body().contains("1.82"));
        assert!(event.body().contains("TAKE_PROFIT"));
    }
}
