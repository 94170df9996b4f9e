use clap::Parser;
use log::{error, info};
use server::connection::{AcceptAllValidator, AuthValidator, StaticTokenValidator};
use server::game::GameServer;
use server::network::NetworkServer;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Authoritative world server")]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "9000")]
    port: u16,
    /// Simulation ticks per second
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,
    /// Maximum simultaneous connections
    #[clap(short, long, default_value = "32")]
    max_clients: usize,
    /// Accepted auth tokens; with none given, every token is accepted
    #[clap(long)]
    token: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let (network, events_rx) = NetworkServer::bind(&address).await?;

    let validator: Box<dyn AuthValidator> = if args.token.is_empty() {
        info!("No tokens configured, accepting all clients");
        Box::new(AcceptAllValidator)
    } else {
        Box::new(StaticTokenValidator::new(args.token))
    };

    let tick_interval = Duration::from_secs_f32(1.0 / args.tick_rate as f32);
    let mut game = GameServer::new(events_rx, validator, tick_interval, args.max_clients);

    let network_handle = tokio::spawn(network.run());
    let game_handle = tokio::spawn(async move { game.run().await });

    tokio::select! {
        result = network_handle => {
            if let Err(e) = result {
                error!("Network task panicked: {}", e);
            }
        }
        result = game_handle => {
            if let Err(e) = result {
                error!("Simulation task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
