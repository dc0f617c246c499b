//! Command-line surface.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use ratchet_config::{load_config, Mode};
use ratchet_core::{Direction, SymbolInfo, TradeMode};
use ratchet_engine::ShutdownSignal;
use ratchet_gates::{SignalCandidate, StaticNewsCalendar, WeeklyClose};
use ratchet_sim::SimBroker;
use ratchet_trade::StaticSignalSource;
use rust_decimal::Decimal;
use tracing::info;

use crate::runtime::Runtime;
use crate::telemetry;

#[derive(Parser)]
#[command(name = "ratchet", about = "Broker-connected trade lifecycle engine")]
struct Cli {
    /// Configuration environment (loads config/{env}.toml).
    #[arg(long)]
    env: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against a live broker connector.
    Live,
    /// Run against the deterministic simulation broker.
    Sim,
}

fn d(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}

fn demo_symbols() -> Vec<SymbolInfo> {
    vec![
        SymbolInfo {
            symbol: "EURUSD".into(),
            min_lot: d("0.01"),
            lot_step: d("0.01"),
            contract_value: d("100000"),
            point: d("0.0001"),
            stops_level: d("0.0002"),
            trade_mode: TradeMode::Full,
            swap_free: true,
        },
        SymbolInfo {
            symbol: "GBPUSD".into(),
            min_lot: d("0.01"),
            lot_step: d("0.01"),
            contract_value: d("100000"),
            point: d("0.0001"),
            stops_level: d("0.0002"),
            trade_mode: TradeMode::Full,
            swap_free: true,
        },
    ]
}

/// A deterministic quote drift so a simulation run exercises the whole
/// lifecycle without external data.
fn spawn_sim_feed(broker: Arc<SimBroker>, shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        let mut step: i64 = 0;
        while shutdown.sleep(std::time::Duration::from_millis(200)).await {
            step += 1;
            // Triangle wave around the open, +-20 points.
            let phase = (step % 80 - 40).abs() - 20;
            let offset = Decimal::new(phase, 4) / Decimal::new(10, 0);
            let bid = d("1.1000") + offset;
            broker.push_quote("EURUSD", bid, bid + d("0.0002"));
            let bid = d("1.2700") - offset;
            broker.push_quote("GBPUSD", bid, bid + d("0.0003"));
        }
    });
}

/// Parse arguments, load configuration, and run the selected mode.
pub async fn run_app() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.env.as_deref())?;
    telemetry::init_tracing(
        &config.telemetry.log_level,
        config.telemetry.log_path.as_deref(),
    )?;

    match cli.command {
        Command::Live => {
            // Venue connectors register themselves at build time the way
            // the sim connector does; none ships in the default build.
            bail!("live mode requires a broker connector; none is compiled into this build");
        }
        Command::Sim => {
            config.mode = Mode::Simulation;
            info!("starting simulation run");
            let broker = Arc::new(SimBroker::new(demo_symbols()));
            broker.push_quote("EURUSD", d("1.1000"), d("1.1002"));
            broker.push_quote("GBPUSD", d("1.2700"), d("1.2703"));

            let signals = Arc::new(StaticSignalSource::new(vec![vec![SignalCandidate {
                symbol: "EURUSD".into(),
                direction: Direction::Long,
                quality_score: 82,
                bar_volume: d("1500"),
            }]]));

            let shutdown = ShutdownSignal::new();
            shutdown.listen_for_ctrl_c();
            spawn_sim_feed(broker.clone(), shutdown.clone());

            let runtime = Runtime::build(
                config,
                broker,
                signals,
                Box::new(WeeklyClose::fx()),
                Box::new(StaticNewsCalendar::empty()),
            )
            .await?;
            runtime.run(shutdown).await
        }
    }
}
