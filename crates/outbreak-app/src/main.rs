use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use outbreak_core::{NullSink, OutbreakConfig, Simulation, TallySink};
use outbreak_storage::{export_report, CsvExporter, SharedExporter};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    name = "outbreak",
    version,
    about = "Run a grid epidemic simulation headlessly and export its tick history"
)]
struct Cli {
    /// Grid width in cells.
    #[arg(long, default_value_t = 256)]
    width: u32,
    /// Grid height in cells.
    #[arg(long, default_value_t = 256)]
    height: u32,
    /// Probability of infecting each co-located normal agent per tick.
    #[arg(long, default_value_t = 0.75)]
    infection_chance: f64,
    /// Number of ticks an agent stays infected.
    #[arg(long, default_value_t = 16)]
    infection_duration: u32,
    /// Number of ticks an agent stays immune.
    #[arg(long, default_value_t = 32)]
    immunity_duration: u32,
    /// Agents seeded in the normal state.
    #[arg(long, default_value_t = 65_535)]
    normal: usize,
    /// Agents seeded in the infected state.
    #[arg(long, default_value_t = 1)]
    infected: usize,
    /// Agents seeded in the immune state.
    #[arg(long, default_value_t = 0)]
    immune: usize,
    /// Maximum ticks to run; negative runs until the epidemic dies out.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    ticks: i64,
    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
    /// Write the tick history to this CSV file.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Prepend a column header to the plain CSV output.
    #[arg(long)]
    header: bool,
    /// Write the detailed report (per-tick deltas and the cumulative
    /// infection count) instead of plain rows. Requires --output.
    #[arg(long, requires = "output")]
    report: bool,
    /// Minimum wall-clock milliseconds per tick.
    #[arg(long, default_value_t = 0)]
    tick_delay_ms: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = OutbreakConfig {
        width: cli.width,
        height: cli.height,
        infection_chance: cli.infection_chance,
        infection_duration: cli.infection_duration,
        immunity_duration: cli.immunity_duration,
        initial_normal: cli.normal,
        initial_infected: cli.infected,
        initial_immune: cli.immune,
        tick_budget: cli.ticks,
        rng_seed: cli.seed,
    };
    info!(
        width = config.width,
        height = config.height,
        population = config.total_population(),
        infected = config.initial_infected,
        "Launching outbreak simulation"
    );

    // Streaming export only applies to the plain row format; the report
    // needs the finished history for its delta columns.
    let mut exporter_handle = None;
    let sink: Box<dyn TallySink> = match (&cli.output, cli.report) {
        (Some(path), false) => {
            let exporter = if cli.header {
                CsvExporter::create_with_header(path)
            } else {
                CsvExporter::create(path)
            }
            .with_context(|| format!("creating csv export at {}", path.display()))?;
            let shared = Arc::new(Mutex::new(exporter));
            exporter_handle = Some(Arc::clone(&shared));
            Box::new(SharedExporter::new(shared))
        }
        _ => Box::new(NullSink),
    };

    let mut sim =
        Simulation::with_sink(config, sink).context("invalid simulation configuration")?;

    let pace = Duration::from_millis(cli.tick_delay_ms);
    loop {
        let started = Instant::now();
        let Some(report) = sim.step() else { break };
        if report.tick.0 % 100 == 0 {
            debug!(
                tick = report.tick.0,
                normal = report.tally.normal,
                infected = report.tally.infected,
                immune = report.tally.immune,
                "Tick processed"
            );
        }
        if !pace.is_zero() {
            let elapsed = started.elapsed();
            if elapsed < pace {
                thread::sleep(pace - elapsed);
            }
        }
    }

    let tally = sim.latest_tally();
    info!(
        ticks = sim.tick().0,
        normal = tally.normal,
        infected = tally.infected,
        immune = tally.immune,
        total_infections = sim.total_infections(),
        "Simulation finished"
    );

    match (&cli.output, cli.report) {
        (Some(path), true) => {
            export_report(path, sim.history(), sim.total_infections())
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!(path = %path.display(), rows = sim.history().len(), "Report written");
        }
        (Some(path), false) => {
            let rows = sim.history().len();
            drop(sim);
            let handle = exporter_handle.context("streaming exporter missing")?;
            let exporter = Arc::into_inner(handle)
                .context("exporter still shared after simulation drop")?
                .into_inner()
                .map_err(|_| anyhow!("exporter mutex poisoned"))?;
            exporter.finish().context("flushing csv export")?;
            info!(path = %path.display(), rows, "History written");
        }
        (None, _) => {}
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
