//! DSU console observer
//!
//! Seeds the inventory, starts the transports, and prints inventory events
//! until interrupted. Stands in for a graphical front-end: everything it
//! shows comes through the same observer contract a UI would bind to.

use anyhow::Result;
use clap::Parser;
use dsu_core::{ElUdp, Inventory, InventoryEvent, Locator, LocatorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dsu", about = "Device Service Utility console observer")]
struct Args {
    /// Unicast device seed file
    #[arg(long, default_value = "devices.ini")]
    seed: PathBuf,

    /// Local bind address for the Locator socket
    #[arg(long, default_value = "0.0.0.0:1770")]
    bind: SocketAddr,

    /// UDP port devices listen on for broadcast frames
    #[arg(long, default_value_t = dsu_core::LOCATOR_PORT)]
    device_port: u16,

    /// Seconds between broadcast polls
    #[arg(long, default_value_t = 2.0)]
    poll_interval: f64,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let inventory = Inventory::new();
    let eludp = ElUdp::new();
    dsu_core::load_seed(&args.seed, &inventory, Some(&eludp));

    let json = args.json;
    inventory.bind(
        Arc::new(move |event: &InventoryEvent| print_event(event, json)),
        None,
    );

    let config = LocatorConfig {
        bind: args.bind,
        device_port: args.device_port,
        poll_interval: Duration::from_secs_f64(args.poll_interval),
        interfaces: None,
    };
    let locator = Locator::start(config, inventory.clone()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    locator.shutdown().await;
    eludp.close();
    Ok(())
}

fn print_event(event: &InventoryEvent, json: bool) {
    if json {
        let line = serde_json::json!({
            "event": format!("{:?}", event.kind()),
            "device": event.device().summary(),
        });
        println!("{line}");
        return;
    }
    match event {
        InventoryEvent::Appended(dev) => println!("+ {dev}"),
        InventoryEvent::Removed(dev) => println!("- {dev}"),
        InventoryEvent::Updated(dev) => println!("~ {dev}"),
        InventoryEvent::PollResponse(_) => {}
        InventoryEvent::CmdResponse { device, cmd, pack } => {
            println!("< {device} {cmd:?} {:02x?}", pack.as_ref());
        }
        InventoryEvent::ConnectionLost(dev) => println!("! connection lost: {dev}"),
    }
}
