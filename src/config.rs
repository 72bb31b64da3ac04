use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::errors::{AgentError, AgentResult};

/// Operational flags. Most tuning knobs live in `AgentConfig`; these are the
/// handful an operator reaches for at process start.
#[derive(Debug, Parser)]
#[command(name = "threshold-agent", about = "Binary prediction-market momentum agent")]
pub struct Cli {
    /// Use the venue's demo/sandbox environment instead of production.
    #[arg(long)]
    pub demo: bool,

    /// Optional TOML file overriding defaults; environment variables and CLI flags still win over it.
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub entry_threshold: Decimal,
    pub profit_target: Decimal,
    pub stop_loss: Decimal,
    pub max_position_pct: Decimal,
    pub max_exposure_pct: Decimal,
    pub max_positions: usize,
    pub min_position_dollars: Decimal,
    pub min_liquidity: Decimal,
    pub min_volume: Decimal,
    pub max_spread: Decimal,
    pub max_hold_hours: i64,
    pub close_buffer_minutes: i64,
    pub daily_loss_limit: Decimal,
    pub max_consecutive_losses: u32,
    pub api_error_rate_limit: Decimal,
    pub stream_silence_s: u64,
    pub stream_force_exit_s: u64,
    pub read_rate: u32,
    pub write_rate: u32,
    pub use_demo: bool,
    pub min_risk_reward: Decimal,
    pub slippage_cap: Decimal,
    pub entry_timeout_s: u64,

    pub database_url: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_from: String,
    pub smtp_to: String,
    pub health_port: u16,
    pub log_level: String,

    pub access_key_id: String,
    pub private_key_path: String,
    pub rest_base_url: String,
    pub stream_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            entry_threshold: dec!(0.85),
            profit_target: dec!(0.02),
            stop_loss: dec!(0.01),
            max_position_pct: dec!(0.10),
            max_exposure_pct: dec!(0.30),
            max_positions: 5,
            min_position_dollars: dec!(50),
            min_liquidity: dec!(500),
            min_volume: dec!(10000),
            max_spread: dec!(0.02),
            max_hold_hours: 2,
            close_buffer_minutes: 30,
            daily_loss_limit: dec!(0.05),
            max_consecutive_losses: 5,
            api_error_rate_limit: dec!(0.10),
            stream_silence_s: 15,
            stream_force_exit_s: 30,
            read_rate: 20,
            write_rate: 10,
            use_demo: true,
            min_risk_reward: dec!(2.0),
            slippage_cap: dec!(1.02),
            entry_timeout_s: 60,

            database_url: String::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            smtp_from: String::new(),
            smtp_to: String::new(),
            health_port: 8080,
            log_level: "info".to_string(),

            access_key_id: String::new(),
            private_key_path: String::new(),
            rest_base_url: "https://trading-api.example.com".to_string(),
            stream_url: "wss://trading-api.example.com/ws".to_string(),
        }
    }
}

impl AgentConfig {
    /// Loads defaults, then an optional TOML override, then environment
    /// variables, then CLI flags, in increasing precedence.
    pub fn load(cli: &Cli) -> AgentResult<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = AgentConfig::default();

        if let Some(path) = &cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| AgentError::Fatal(format!("reading config file {}: {}", path, e)))?;
            cfg = toml::from_str(&contents)
                .map_err(|e| AgentError::Fatal(format!("parsing config file {}: {}", path, e)))?;
            log::info!("applied config override from {}", path);
        }

        apply_env(&mut cfg);

        cfg.use_demo = cli.demo || cfg.use_demo;
        cfg.log_level = cli.log_level.clone();
        if let Some(port) = cli.health_port {
            cfg.health_port = port;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> AgentResult<()> {
        let zero = Decimal::ZERO;
        let one = Decimal::ONE;
        if !(self.entry_threshold > zero && self.entry_threshold < one) {
            return Err(AgentError::Fatal("entry_threshold must be in (0,1)".into()));
        }
        if self.max_positions == 0 {
            return Err(AgentError::Fatal("max_positions must be > 0".into()));
        }
        if self.max_exposure_pct <= zero || self.max_exposure_pct > one {
            return Err(AgentError::Fatal("max_exposure_pct must be in (0,1]".into()));
        }
        if self.max_position_pct <= zero || self.max_position_pct > one {
            return Err(AgentError::Fatal("max_position_pct must be in (0,1]".into()));
        }
        if self.min_risk_reward <= zero {
            return Err(AgentError::Fatal("min_risk_reward must be positive".into()));
        }
        if self.access_key_id.is_empty() && !self.use_demo {
            return Err(AgentError::Fatal("access_key_id must be set in live mode".into()));
        }
        Ok(())
    }
}

fn apply_env(cfg: &mut AgentConfig) {
    macro_rules! env_str {
        ($field:expr, $key:expr) => {
            if let Ok(v) = std::env::var($key) {
                $field = v;
            }
        };
    }
    macro_rules! env_parse {
        ($field:expr, $key:expr) => {
            if let Ok(v) = std::env::var($key) {
                if let Ok(parsed) = v.parse() {
                    $field = parsed;
                }
            }
        };
    }

    env_parse!(cfg.entry_threshold, "ENTRY_THRESHOLD");
    env_parse!(cfg.profit_target, "PROFIT_TARGET");
    env_parse!(cfg.stop_loss, "STOP_LOSS");
    env_parse!(cfg.max_position_pct, "MAX_POSITION_PCT");
    env_parse!(cfg.max_exposure_pct, "MAX_EXPOSURE_PCT");
    env_parse!(cfg.max_positions, "MAX_POSITIONS");
    env_parse!(cfg.min_position_dollars, "MIN_POSITION_DOLLARS");
    env_parse!(cfg.min_liquidity, "MIN_LIQUIDITY");
    env_parse!(cfg.min_volume, "MIN_VOLUME");
    env_parse!(cfg.max_spread, "MAX_SPREAD");
    env_parse!(cfg.max_hold_hours, "MAX_HOLD_HOURS");
    env_parse!(cfg.close_buffer_minutes, "CLOSE_BUFFER_MINUTES");
    env_parse!(cfg.daily_loss_limit, "DAILY_LOSS_LIMIT");
    env_parse!(cfg.max_consecutive_losses, "MAX_CONSECUTIVE_LOSSES");
    env_parse!(cfg.api_error_rate_limit, "API_ERROR_RATE_LIMIT");
    env_parse!(cfg.stream_silence_s, "STREAM_SILENCE_S");
    env_parse!(cfg.stream_force_exit_s, "STREAM_FORCE_EXIT_S");
    env_parse!(cfg.read_rate, "READ_RATE");
    env_parse!(cfg.write_rate, "WRITE_RATE");
    env_parse!(cfg.min_risk_reward, "MIN_RISK_REWARD");
    env_parse!(cfg.slippage_cap, "SLIPPAGE_CAP");
    env_parse!(cfg.entry_timeout_s, "ENTRY_TIMEOUT_S");

    env_str!(cfg.database_url, "DATABASE_URL");
    env_str!(cfg.smtp_host, "SMTP_HOST");
    env_parse!(cfg.smtp_port, "SMTP_PORT");
    env_str!(cfg.smtp_user, "SMTP_USER");
    env_str!(cfg.smtp_password, "SMTP_PASSWORD");
    env_str!(cfg.smtp_from, "SMTP_FROM");
    env_str!(cfg.smtp_to, "SMTP_TO");
    env_parse!(cfg.health_port, "HEALTH_PORT");
    env_str!(cfg.access_key_id, "VENUE_ACCESS_KEY_ID");
    env_str!(cfg.private_key_path, "VENUE_PRIVATE_KEY_PATH");
    env_str!(cfg.rest_base_url, "VENUE_REST_BASE_URL");
    env_str!(cfg.stream_url, "VENUE_STREAM_URL");
    env_parse!(cfg.use_demo, "USE_DEMO");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = AgentConfig::default();
        cfg.use_demo = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_entry_threshold() {
        let mut cfg = AgentConfig::default();
        cfg.entry_threshold = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_positions() {
        let mut cfg = AgentConfig::default();
        cfg.max_positions = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn live_mode_requires_access_key() {
        let mut cfg = AgentConfig::default();
        cfg.use_demo = false;
        cfg.access_key_id.clear();
        assert!(cfg.validate().is_err());
    }
}
