use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

use market_signals::api::{self, AppState};
use market_signals::config::{FeedConfig, ReconnectPolicy, SignalPolicy, DEFAULT_REST_URL, DEFAULT_WS_URL};
use market_signals::feed::{
    BinanceConnector, DemoConnector, DemoMarket, MarketDataFeed, MarketDataSource, RandomWalk, RestClient,
};
use market_signals::signals::SignalService;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Symbols offered for selection (comma-separated, first is active)
    #[arg(short, long, env = "SIGNAL_SYMBOLS", default_value = "BTCUSDT,ETHUSDT,SOLUSDT,BNBUSDT")]
    symbols: String,

    /// Port to run the web server on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Exchange stream endpoint
    #[arg(long, env = "MARKET_WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Exchange REST endpoint
    #[arg(long, env = "MARKET_REST_URL", default_value = DEFAULT_REST_URL)]
    rest_url: String,

    /// Use the offline random-walk feed instead of the exchange
    #[arg(long)]
    demo: bool,

    /// Signal policy preset: conservative or responsive
    #[arg(long, env = "SIGNAL_POLICY", default_value = "conservative")]
    policy: String,

    /// Override the preset's base cooldown (milliseconds)
    #[arg(long)]
    cooldown_ms: Option<u64>,

    /// Override the preset's BUY/SELL vote margin
    #[arg(long)]
    margin: Option<usize>,

    /// Reconnect attempts before the feed gives up
    #[arg(long, default_value = "5")]
    max_reconnect_attempts: u32,

    /// REST ticker polling interval (milliseconds, 0 disables)
    #[arg(long, default_value = "10000")]
    ticker_poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("market_signals=info")),
        )
        .init();

    let args = Args::parse();

    let mut policy = SignalPolicy::from_name(&args.policy)
        .ok_or_else(|| anyhow!("Unknown policy {:?} (expected conservative or responsive)", args.policy))?;
    if let Some(cooldown_ms) = args.cooldown_ms {
        policy.cooldown_ms = cooldown_ms;
    }
    if let Some(margin) = args.margin {
        policy.margin_required = margin;
    }

    let feed_config = FeedConfig {
        ws_base_url: args.ws_url.clone(),
        rest_base_url: args.rest_url.clone(),
        reconnect: ReconnectPolicy {
            max_attempts: args.max_reconnect_attempts,
            ..Default::default()
        },
        ticker_poll_interval_ms: args.ticker_poll_ms,
        ..Default::default()
    };

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    let active = symbols
        .first()
        .cloned()
        .context("At least one symbol is required")?;

    info!("Starting market signal server");
    info!("Symbols: {}", symbols.join(", "));
    info!("Policy: {} ({:?})", args.policy, policy);
    info!("Port: {}", args.port);

    let (feed, source): (MarketDataFeed, Arc<dyn MarketDataSource>) = if args.demo {
        warn!("Demo mode: prices are a random walk, not market data");
        let walk = RandomWalk::new();
        let source: Arc<dyn MarketDataSource> = Arc::new(DemoMarket::new(walk.clone()));
        let connector = Arc::new(DemoConnector::new(walk, Duration::from_millis(250)));
        (
            MarketDataFeed::with_parts(feed_config.clone(), &active, connector, source.clone()),
            source,
        )
    } else {
        info!("Stream: {}", args.ws_url);
        let source: Arc<dyn MarketDataSource> = Arc::new(RestClient::new(args.rest_url.clone()));
        let connector = Arc::new(BinanceConnector::new(
            args.ws_url.clone(),
            feed_config.kline_interval.clone(),
        ));
        (
            MarketDataFeed::with_parts(feed_config.clone(), &active, connector, source.clone()),
            source,
        )
    };
    let feed = Arc::new(feed);

    let service = Arc::new(
        SignalService::new(policy, symbols)
            .with_source(source, &feed_config)
            .with_feed(feed.clone()),
    );

    // Spawn the event consumer before connecting so no early events are missed
    tokio::spawn(service.clone().run(feed.subscribe()));
    feed.connect().await;

    let state = Arc::new(AppState {
        service: service.clone(),
    });
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    feed.disconnect().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
