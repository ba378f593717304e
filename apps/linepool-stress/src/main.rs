//! linepool stress driver
//!
//! Fills a headless polyline arena with random-walk lines, then runs rounds of
//! removals, updates, visibility toggles, cache evictions and renders while the
//! background defrag worker runs. Finishes with a full defragment and checks
//! every surviving line's GPU contents against its cached copy.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p linepool-stress -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod generator;

use std::time::Instant;

use anyhow::{bail, Context};
use linepool_arena::{PolylineBatch, PolylineManager};
use linepool_core::{ArenaConfig, Color, PrimitiveId};
use linepool_gpu::{HeadlessBackend, HeadlessPass};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::generator::PolylineGenerator;

const PALETTE: [Color; 6] = [
    Color::RED,
    Color::GREEN,
    Color::BLUE,
    Color::WHITE,
    Color::rgb(1.0, 1.0, 0.0),
    Color::rgb(0.0, 1.0, 1.0),
];

struct Options {
    lines: usize,
    min_points: usize,
    max_points: usize,
    rounds: usize,
    seed: u64,
    background: bool,
    config: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lines: 20_000,
            min_points: 2,
            max_points: 64,
            rounds: 10,
            seed: 42,
            background: true,
            config: None,
        }
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    init_logging();

    let options = parse_args(std::env::args().skip(1))?;
    let config = match &options.config {
        Some(path) => {
            let source =
                std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
            ArenaConfig::from_toml_str(&source).with_context(|| format!("parsing config {path}"))?
        }
        None => ArenaConfig::default(),
    };
    info!(?config, "Arena configuration");

    let manager = PolylineManager::with_config(HeadlessBackend::new(), config)?;
    let mut generator = PolylineGenerator::new(options.seed);
    let mut rng = StdRng::seed_from_u64(options.seed ^ 0x5eed);

    let start = Instant::now();
    let added = populate(&manager, &mut generator, &options)?;
    info!(
        added,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Initial population uploaded"
    );

    if options.background {
        manager.start_background_defrag()?;
    }

    for round in 0..options.rounds {
        run_round(&manager, &mut generator, &mut rng, &options)?;

        let mut pass = HeadlessPass::new();
        let frame = Instant::now();
        let rendered = manager.render_visible(&mut pass)?;
        let stats = manager.stats();
        info!(
            round,
            primitives = stats.primitives,
            blocks = stats.blocks,
            utilization = format_args!("{:.2}", stats.utilization()),
            draw_calls = rendered.draw_calls,
            drawn = rendered.primitives,
            compacted = rendered.compacted_blocks,
            frame_us = frame.elapsed().as_micros() as u64,
            "Round complete"
        );
    }

    manager.stop_background_defrag()?;
    for error in manager.take_worker_errors() {
        warn!(%error, "Background worker reported an error");
    }

    let compacted = manager.defragment_now()?;
    let mismatches = verify(&manager)?;
    let stats = manager.stats();
    info!(
        compacted,
        primitives = stats.primitives,
        live_vertices = stats.live_vertices,
        capacity_vertices = stats.capacity_vertices,
        growths = stats.growths,
        compactions = stats.compactions,
        "Stress run finished"
    );

    if mismatches > 0 {
        bail!("{mismatches} polylines read back differently from their cached copies");
    }
    Ok(())
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,linepool_arena=trace,linepool_gpu=trace,linepool_stress=trace")
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

/// Upload the initial lines, one batch per palette color.
fn populate(
    manager: &PolylineManager<HeadlessBackend>,
    generator: &mut PolylineGenerator,
    options: &Options,
) -> anyhow::Result<usize> {
    let per_color = options.lines.div_ceil(PALETTE.len());
    let mut added = 0;
    for color in PALETTE {
        let lines = generator.lines(per_color, options.min_points, options.max_points);
        let ids: Vec<PrimitiveId> = (0..lines.len()).map(|_| manager.allocate_id()).collect();
        added += manager.add_batch(&[PolylineBatch::new(
            &ids,
            &lines.positions,
            &lines.counts,
            color,
        )])?;
    }
    Ok(added)
}

/// Mutate a random tenth of the population.
fn run_round(
    manager: &PolylineManager<HeadlessBackend>,
    generator: &mut PolylineGenerator,
    rng: &mut StdRng,
    options: &Options,
) -> anyhow::Result<()> {
    let mut ids: Vec<PrimitiveId> = manager
        .block_layouts()
        .iter()
        .flat_map(|layout| layout.slots.iter().map(|slot| slot.id))
        .collect();
    ids.shuffle(rng);

    let tenth = ids.len() / 10;
    let (removed, rest) = ids.split_at(tenth);
    let (updated, rest) = rest.split_at(tenth.min(rest.len()));
    let (toggled, rest) = rest.split_at((tenth / 2).min(rest.len()));
    let (evicted, _) = rest.split_at((tenth / 4).min(rest.len()));

    manager.remove_batch(removed)?;
    for &id in updated {
        let points = generator.point_count(options.min_points, options.max_points * 2);
        manager.update(id, &generator.polyline(points))?;
    }
    for &id in toggled {
        manager.set_visible(id, rng.gen_bool(0.5))?;
    }
    for &id in evicted {
        manager.release_cached_vertices(id)?;
    }

    let lines = generator.lines(removed.len(), options.min_points, options.max_points);
    let new_ids: Vec<PrimitiveId> = (0..lines.len()).map(|_| manager.allocate_id()).collect();
    let color = PALETTE[rng.gen_range(0..PALETTE.len())];
    manager.add_batch(&[PolylineBatch::new(
        &new_ids,
        &lines.positions,
        &lines.counts,
        color,
    )])?;
    Ok(())
}

/// Count live polylines whose GPU contents differ from their cached copy.
fn verify(manager: &PolylineManager<HeadlessBackend>) -> anyhow::Result<usize> {
    let mut mismatches = 0;
    for layout in manager.block_layouts() {
        if !layout.is_dense() {
            warn!(block = ?layout.key, "Block not dense after defragment");
            mismatches += 1;
        }
        for slot in &layout.slots {
            let Some(cached) = manager.vertices(slot.id) else {
                continue;
            };
            if manager.read_back(slot.id)?.as_ref() != Some(&cached) {
                warn!(id = %slot.id, "GPU contents differ from cached copy");
                mismatches += 1;
            }
        }
    }
    Ok(mismatches)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Options> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--lines" => options.lines = value("--lines")?.parse()?,
            "--min-points" => options.min_points = value("--min-points")?.parse()?,
            "--max-points" => options.max_points = value("--max-points")?.parse()?,
            "--rounds" => options.rounds = value("--rounds")?.parse()?,
            "--seed" => options.seed = value("--seed")?.parse()?,
            "--config" => options.config = Some(value("--config")?),
            "--no-background" => options.background = false,
            other => bail!("unknown argument: {other} (see --help)"),
        }
    }
    Ok(options)
}

fn print_help() {
    eprintln!(
        "linepool stress driver

USAGE:
    cargo run -p linepool-stress -- [OPTIONS]

OPTIONS:
    --lines <N>          Initial polyline count (default: 20000)
    --min-points <N>     Minimum points per polyline (default: 2)
    --max-points <N>     Maximum points per polyline (default: 64)
    --rounds <N>         Mutation/render rounds (default: 10)
    --seed <N>           Random seed (default: 42)
    --config <PATH>      Arena configuration TOML file
    --no-background      Do not start the background defrag worker
    -h, --help           Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG             Set log level (e.g., info, debug, trace)"
    );
}
