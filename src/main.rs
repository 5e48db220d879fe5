use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error};
use relay_tunnel::{
    config::load_config_from_path,
    outbound::{ConnectionContext, Dispatcher, Route},
    relay::pipe,
    resolver::HostResolver,
    utils::logger::setup_logger,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(version, author = "llc1123 <i@llc.moe>")]
#[command(about = "Open one tunnel and pipe stdin/stdout through it")]
struct Opts {
    #[arg(short, long, default_value = "config.toml", env = "RELAY_TUNNEL_CONFIG")]
    config: String,
    /// Destination host
    host: String,
    /// Destination port
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = load_config_from_path(&opts.config)?;

    setup_logger(config.log_level).context("Failed to set up logger")?;

    let resolver = Arc::new(HostResolver::new(config.resolver.build()?));
    let dispatcher = Dispatcher::new(resolver);
    let route = Route::from(config.relay);

    let ctx = ConnectionContext::new(
        opts.host,
        opts.port,
        |stream| async move {
            let received = pipe(tokio::io::stdin(), tokio::io::stdout(), stream).await?;
            debug!("tunnel closed after receiving {} bytes", received);
            Ok::<_, anyhow::Error>(())
        },
        || error!("Connection aborted"),
    );

    if let Err(e) = dispatcher.connect(ctx, &route).await {
        error!("[{}] {}", e.code(), e);
        std::process::exit(1);
    }
    Ok(())
}
