//! Tails the market stream and logs every applied update.
//!
//! Usage:
//!   MARKET_SYNC_STREAM_URL=wss://stream.example/ws \
//!   market-sync-tail --symbol SOLUSDT --interval 5m --history

use clap::Parser;
use market_sync::logging::{init_tracing, DEFAULT_LOG_FILTER};
use market_sync::{CandleInterval, MarketDataClient, SyncConfigArgs, SyncError};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "market-sync-tail")]
#[command(about = "Stream tickers and candles into memory and log what changes")]
struct Args {
    /// Symbol to follow; repeat for more than one
    #[arg(long = "symbol", required = true)]
    symbols: Vec<String>,

    /// Candle interval to follow for every symbol (1m, 5m, 1h, ...)
    #[arg(long = "interval")]
    intervals: Vec<CandleInterval>,

    /// Load the most recent page of candles before streaming
    #[arg(long)]
    history: bool,

    /// Overrides MARKET_SYNC_STREAM_URL
    #[arg(long)]
    stream_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    init_tracing(&format!("{DEFAULT_LOG_FILTER},market_sync_tail=info"));
    let args = Args::parse();

    let mut config_args = SyncConfigArgs::from_env()?;
    if args.stream_url.is_some() {
        config_args.stream_url = args.stream_url.clone();
    }
    let config = config_args.normalize()?;
    info!(url = %config.stream_url, rest = %config.rest_base_url, "starting market tail");

    let client = MarketDataClient::from_config(config);
    let _status = client.on_status_change(|status| {
        info!(
            state = status.state.as_str(),
            attempt = status.reconnect_attempt,
            reason = status.reason.as_deref().unwrap_or(""),
            "stream status"
        );
    });
    let _tickers = client.on_ticker(|ticker| {
        info!(
            symbol = %ticker.symbol,
            last = ticker.last_price,
            mark = ticker.mark_price,
            funding = ticker.funding_rate,
            "ticker"
        );
    });
    let _candles = client.on_candle(|update| {
        info!(
            series = %update.key,
            open_time = update.candle.open_time,
            close = update.candle.close,
            volume = update.candle.volume,
            "candle"
        );
    });

    for symbol in &args.symbols {
        client.subscribe(symbol)?;
        if let Err(error) = client.refresh_ticker(symbol).await {
            warn!(%symbol, "initial ticker snapshot failed: {error}");
        }
        for interval in &args.intervals {
            client.subscribe_series(symbol, *interval)?;
            if !args.history {
                continue;
            }
            match client.load_series(symbol, *interval).await {
                Ok(len) => info!(%symbol, interval = %interval, len, "history loaded"),
                Err(error) => warn!(%symbol, interval = %interval, "history load failed: {error}"),
            }
        }
    }

    client.connect();
    tokio::signal::ctrl_c().await?;

    info!("shutting down market tail");
    client.disconnect();
    Ok(())
}
