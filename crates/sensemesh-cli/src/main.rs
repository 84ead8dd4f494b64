//! SenseMesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating a sensor mesh of many nodes on a shared clock
//! - Running a simulated mesh in real time and streaming sink readings
//! - Encoding and decoding wire records
//! - Showing protocol constants

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensemesh_core::mesh::packet::{NONCE_MAX, NONCE_MIN};
use sensemesh_core::mesh::traits::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_LOOP_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_SENSOR_INTERVAL_MS,
};
use sensemesh_core::mesh::{Message, MeshSimulator, SimConfig, Topology};
use sensemesh_core::sensor::{SYNTHETIC_CO2, SYNTHETIC_HUMIDITY, SYNTHETIC_TEMPERATURE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sensemesh")]
#[command(author, version, about = "Multi-hop sensor mesh tools", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh simulation for a fixed number of steps
    Simulate {
        /// Number of nodes, sink included
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Node placement (line, grid, random)
        #[arg(short, long)]
        topology: Option<Topology>,

        /// Number of simulation steps
        #[arg(short, long, default_value = "3000")]
        steps: u64,

        /// Per-link frame loss probability (0.0 - 1.0)
        #[arg(long)]
        loss: Option<f64>,

        /// Radio range in meters
        #[arg(long)]
        range: Option<f64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// JSON simulation config (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Kill this node index partway through
        #[arg(long)]
        kill: Option<usize>,

        /// Step at which --kill takes effect
        #[arg(long, default_value = "1000")]
        kill_at: u64,

        /// Print sink deliveries as they arrive
        #[arg(long)]
        deliveries: bool,
    },

    /// Run a simulated mesh in real time until Ctrl+C or --duration
    ///
    /// Each step sleeps for the node loop delay, which replaces any
    /// `step_ms` given in --config.
    Run {
        /// Number of nodes, sink included
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Node placement (line, grid, random)
        #[arg(short, long)]
        topology: Option<Topology>,

        /// Seconds to run (0 = until Ctrl+C)
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// JSON simulation config (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Encode a JSON message into a wire record
    Encode {
        /// Message as JSON, e.g. '{"DataAck":{"nonce":4321}}'
        message: String,
    },

    /// Decode a wire record and print it as JSON
    Decode {
        /// Wire record, e.g. '1,0,aa:bb:cc:dd:ee:01'
        record: String,
    },

    /// Show protocol constants and wire formats
    Info,
}

/// Build the simulation config from an optional file plus flag overrides
fn build_sim_config(
    path: Option<PathBuf>,
    nodes: Option<usize>,
    topology: Option<Topology>,
    loss: Option<f64>,
    range: Option<f64>,
    seed: Option<u64>,
) -> Result<SimConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<SimConfig>(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => SimConfig::default().with_seed(rand::random()),
    };

    if let Some(n) = nodes {
        config.node_count = n;
    }
    if let Some(t) = topology {
        config.topology = t;
    }
    if let Some(p) = loss {
        config.loss_probability = p;
    }
    if let Some(r) = range {
        config.range = r;
    }
    if let Some(s) = seed {
        config.seed = s;
    }
    Ok(config)
}

fn cmd_simulate(
    config: SimConfig,
    steps: u64,
    kill: Option<usize>,
    kill_at: u64,
    show_deliveries: bool,
) -> Result<()> {
    println!("=== Sensor Mesh Simulation ===");
    println!();
    println!("Nodes:     {}", config.node_count);
    println!("Topology:  {:?}", config.topology);
    println!("Range:     {:.0} m", config.range);
    println!("Loss:      {:.1}%", config.loss_probability * 100.0);
    println!("Seed:      {}", config.seed);
    println!("Steps:     {} x {} ms", steps, config.step_ms);
    println!();

    let mut sim = MeshSimulator::new(config).context("Failed to create simulation")?;
    if let Some(idx) = kill {
        if idx >= sim.node_count() {
            anyhow::bail!("--kill index {} out of range (0..{})", idx, sim.node_count());
        }
    }

    let mut converged_at = None;
    for step in 1..=steps {
        if let Some(idx) = kill {
            if step == kill_at && sim.kill_node(idx) {
                println!("Step {}: killed node {}", step, idx);
            }
        }

        sim.step();

        if converged_at.is_none() && sim.is_converged() {
            converged_at = Some(step);
            info!(step, "All sensor nodes connected");
        }
        if show_deliveries {
            for reading in sim.take_delivered() {
                println!("{}", reading);
            }
        }
    }

    match converged_at {
        Some(step) => println!("Converged after {} steps", step),
        None => warn!("Mesh never fully converged"),
    }
    sim.print_summary();
    Ok(())
}

/// Step a real-time run at the node loop delay
///
/// Returns the `step_ms` that was replaced, if it differed.
fn apply_loop_delay(config: &mut SimConfig) -> Option<u64> {
    let step_ms = config.node.loop_delay_ms.max(1);
    let replaced = (config.step_ms != step_ms).then_some(config.step_ms);
    config.step_ms = step_ms;
    replaced
}

fn cmd_run(mut config: SimConfig, duration: u64) -> Result<()> {
    if let Some(configured) = apply_loop_delay(&mut config) {
        warn!(
            configured,
            used = config.step_ms,
            "Real-time run steps at the loop delay, ignoring step_ms"
        );
    }
    let step_delay = Duration::from_millis(config.step_ms);

    let mut sim = MeshSimulator::new(config).context("Failed to create mesh")?;

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let run_duration = if duration > 0 {
        Some(Duration::from_secs(duration))
    } else {
        None
    };

    eprintln!(
        "Running {} nodes in real time (Ctrl+C to stop)",
        sim.node_count()
    );
    println!("source,co2,temperature,humidity");

    let start_time = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = run_duration {
            if start_time.elapsed() >= limit {
                break;
            }
        }

        sim.step();
        for reading in sim.take_delivered() {
            println!("{}", reading);
        }
        std::thread::sleep(step_delay);
    }

    sim.print_summary();
    Ok(())
}

fn cmd_encode(json: &str) -> Result<()> {
    let message: Message = serde_json::from_str(json).context("Invalid message JSON")?;
    println!("{}", message.encode());
    Ok(())
}

fn cmd_decode(record: &str) -> Result<()> {
    let message = Message::decode(record).with_context(|| format!("Failed to decode {:?}", record))?;
    println!("Kind: {:?}", message.kind());
    println!(
        "{}",
        serde_json::to_string_pretty(&message).context("Failed to render message")?
    );
    Ok(())
}

fn cmd_info() -> Result<()> {
    println!("=== SenseMesh Protocol ===");
    println!();
    println!("Timing:");
    println!("  Ack timeout:      {} ms", DEFAULT_ACK_TIMEOUT_MS);
    println!("  Max retries:      {}", DEFAULT_MAX_RETRIES);
    println!("  Sensor interval:  {} ms", DEFAULT_SENSOR_INTERVAL_MS);
    println!("  Loop delay:       {} ms", DEFAULT_LOOP_DELAY_MS);
    println!();
    println!("Nonce range: {}-{}", NONCE_MIN, NONCE_MAX);
    println!();
    println!("Substituted readings:");
    println!("  CO2:          {:?}", SYNTHETIC_CO2);
    println!("  Temperature:  {:?}", SYNTHETIC_TEMPERATURE);
    println!("  Humidity:     {:?}", SYNTHETIC_HUMIDITY);
    println!();
    println!("Wire records (comma-delimited ASCII):");
    println!("  0                                                  discovery request");
    println!("  1,<level>,<origin>                                 discovery reply");
    println!("  2,<dest>,<source>,<co2>,<temp>,<humidity>,<nonce>  data");
    println!("  3,<nonce>                                          data ack");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            topology,
            steps,
            loss,
            range,
            seed,
            config,
            kill,
            kill_at,
            deliveries,
        } => {
            let config = build_sim_config(config, nodes, topology, loss, range, seed)?;
            cmd_simulate(config, steps, kill, kill_at, deliveries)
        }

        Commands::Run {
            nodes,
            topology,
            duration,
            seed,
            config,
        } => {
            let config = build_sim_config(config, nodes, topology, None, None, seed)?;
            cmd_run(config, duration)
        }

        Commands::Encode { message } => cmd_encode(&message),

        Commands::Decode { record } => cmd_decode(&record),

        Commands::Info => cmd_info(),
    }
}
