//! Runtime settings for `keel serve`.

use clap::{ArgAction, Args};
use keel_api::{AuthConfig, ServerConfig};
use keel_domain::ExchangePosition;
use keel_execution::runtime::CoreConfig;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Flags for the `serve` command. Each one falls back to a `KEEL_*` variable.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Symbols to stream, comma separated
    #[arg(long, env = "KEEL_SYMBOLS", value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT")]
    pub symbols: Vec<String>,

    /// Address of the operator API
    #[arg(long, env = "KEEL_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Accepted API keys, comma separated. Empty disables authentication
    #[arg(long, env = "KEEL_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Seconds between scheduled soft reconciliations
    #[arg(long, env = "KEEL_SOFT_INTERVAL_SECS", default_value_t = 3600)]
    pub soft_interval_secs: u64,

    /// Paper market data tick in milliseconds
    #[arg(long, env = "KEEL_TICK_MS", default_value_t = 1000)]
    pub tick_ms: u64,

    /// Request a soft reconciliation on every market data gap
    #[arg(long, env = "KEEL_RECONCILE_ON_GAP", default_value_t = true, action = ArgAction::Set)]
    pub reconcile_on_gap: bool,

    /// Allow cross-origin API requests
    #[arg(long, env = "KEEL_CORS")]
    pub cors: bool,

    /// Position already open on the paper exchange, as SYMBOL=AMOUNT@PRICE (negative amount is short)
    #[arg(long = "paper-position", value_parser = parse_paper_position)]
    pub paper_positions: Vec<ExchangePosition>,
}

/// Resolved settings for one `serve` run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub symbols: Vec<String>,
    pub bind: SocketAddr,
    pub api_keys: Vec<String>,
    pub soft_interval: Duration,
    pub tick_interval: Duration,
    pub reconcile_on_gap: bool,
    pub enable_cors: bool,
    pub paper_positions: Vec<ExchangePosition>,
}

impl Settings {
    pub fn new(data_dir: PathBuf, args: ServeArgs) -> Self {
        Self {
            data_dir,
            symbols: args
                .symbols
                .into_iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            bind: args.bind,
            api_keys: args.api_keys.into_iter().filter(|k| !k.is_empty()).collect(),
            soft_interval: Duration::from_secs(args.soft_interval_secs.max(1)),
            tick_interval: Duration::from_millis(args.tick_ms.max(1)),
            reconcile_on_gap: args.reconcile_on_gap,
            enable_cors: args.cors,
            paper_positions: args.paper_positions,
        }
    }

    pub fn core_config(&self) -> CoreConfig {
        let mut config = CoreConfig::new(&self.data_dir);
        config.service.soft_interval = self.soft_interval;
        config.reconcile_on_gap = self.reconcile_on_gap;
        config
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            enable_cors: self.enable_cors,
            auth: AuthConfig::with_keys(self.api_keys.iter().cloned()),
        }
    }
}

/// Parses `SYMBOL=AMOUNT@PRICE`.
pub fn parse_paper_position(value: &str) -> Result<ExchangePosition, String> {
    let (symbol, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=AMOUNT@PRICE, got {value}"))?;
    let (amount, price) = rest
        .split_once('@')
        .ok_or_else(|| format!("expected SYMBOL=AMOUNT@PRICE, got {value}"))?;

    let amount = Decimal::from_str(amount.trim()).map_err(|e| format!("invalid amount: {e}"))?;
    let price = Decimal::from_str(price.trim()).map_err(|e| format!("invalid price: {e}"))?;
    if price <= Decimal::ZERO {
        return Err(format!("price must be positive, got {price}"));
    }
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err("symbol must not be empty".to_string());
    }

    ExchangePosition::from_signed(symbol, amount, price)
        .ok_or_else(|| "amount must not be zero".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_domain::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_paper_position() {
        let position = parse_paper_position("ethusdt=-2@3100").unwrap();
        assert_eq!(position.symbol, "ETHUSDT");
        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.entry_price, dec!(3100));
    }

    #[test]
    fn test_parse_paper_position_rejects_bad_input() {
        assert!(parse_paper_position("BTCUSDT").is_err());
        assert!(parse_paper_position("BTCUSDT=1").is_err());
        assert!(parse_paper_position("BTCUSDT=0@64000").is_err());
        assert!(parse_paper_position("BTCUSDT=1@-5").is_err());
        assert!(parse_paper_position("=1@5").is_err());
    }

    #[test]
    fn test_settings_build_component_configs() {
        let args = ServeArgs {
            symbols: vec![" btcusdt".to_string(), String::new()],
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            api_keys: vec!["secret".to_string()],
            soft_interval_secs: 60,
            tick_ms: 250,
            reconcile_on_gap: false,
            cors: true,
            paper_positions: Vec::new(),
        };
        let settings = Settings::new(PathBuf::from("/tmp/keel"), args);
        assert_eq!(settings.symbols, vec!["BTCUSDT".to_string()]);

        let core = settings.core_config();
        assert_eq!(core.positions_path, PathBuf::from("/tmp/keel/positions.json"));
        assert_eq!(core.service.soft_interval, Duration::from_secs(60));
        assert!(!core.reconcile_on_gap);

        let server = settings.server_config();
        assert!(server.enable_cors);
        assert!(server.auth.api_keys.contains("secret"));
    }
}
