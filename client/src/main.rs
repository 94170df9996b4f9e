//! Headless client harness. Joins a server, wanders, and logs what the
//! entity mirror sees. Useful for soak-testing a server without a renderer.

use clap::Parser;
use client::interp::Interpolator;
use client::network::{ClientConnection, ConnectionStatus};
use log::info;
use shared::Vec2;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Headless world client")]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:9000")]
    server: String,
    /// Auth token
    #[clap(short, long, default_value = "")]
    token: String,
    /// Display name for the avatar
    #[clap(short, long, default_value = "wanderer")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let mut connection = ClientConnection::connect(&args.server, &args.token).await?;
    connection.join(&args.name).await?;

    let interpolator = Interpolator::new();
    let mut frame = tokio::time::Instant::now();
    let mut last_intent = tokio::time::Instant::now();
    let mut heading = 0.0f32;

    // pump() returns at least once per server tick (or on the staleness
    // deadline), so it paces the whole harness
    while connection.pump().await {
        let now = tokio::time::Instant::now();
        let dt = (now - frame).as_secs_f32();
        frame = now;
        let player_id = connection.player_id();
        interpolator.step(&mut connection.cache, player_id, dt);

        for event in connection.cache.drain_events() {
            info!("Entity event: {:?}", event);
        }

        if connection.status() == ConnectionStatus::Active
            && (now - last_intent) >= Duration::from_millis(50)
        {
            last_intent = now;
            // Wander in a slow circle
            heading += 0.05;
            connection
                .send_intent(Vec2::from_angle(heading), heading, false)
                .await?;
        }
    }
    info!("Session over");

    Ok(())
}
