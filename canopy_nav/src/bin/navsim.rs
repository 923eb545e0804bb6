// Headless load driver for the navigation coordinator.
//
// Builds two grid islands joined by off-mesh links, then runs a frame loop:
// each frame submits random path requests from a `SearchHandle`, toggles
// random obstacles through incremental graph updates, periodically starts a
// cooperative rescan, and calls `update()`. Prints the coordinator's
// counters at the end. Useful for eyeballing pause/scan behaviour with
// `RUST_LOG=canopy_nav=debug`.
//
// Usage:
//   navsim [OPTIONS]
//     --config <PATH>          NavConfig JSON file (default: built-in defaults)
//     --frames <N>             Frames to run (default: 600)
//     --seed <N>               RNG seed (default: 1)
//     --paths-per-frame <N>    Path requests submitted per frame (default: 8)
//     --rescan-every <N>       Start a cooperative rescan every N frames, 0 = never (default: 120)

use canopy_nav::generators::GridGraphSettings;
use canopy_nav::graph_update::GraphUpdate;
use canopy_nav::pathfinding::PathOutcome;
use canopy_nav::{
    Aabb, GraphKind, LinkSource, NavConfig, NavCoordinator, PathRequest, VoxelCoord,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ISLAND_SIZE: u32 = 32;
const ISLAND_GAP: i32 = 8;

struct Options {
    config: Option<String>,
    frames: u64,
    seed: u64,
    paths_per_frame: usize,
    rescan_every: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            frames: 600,
            seed: 1,
            paths_per_frame: 8,
            rescan_every: 120,
        }
    }
}

#[derive(Default)]
struct Tally {
    found: AtomicU64,
    no_path: AtomicU64,
    unsnapped: AtomicU64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args();
    let config = match &options.config {
        Some(path) => load_config(path),
        None => NavConfig::default(),
    };

    if let Err(e) = run(config, &options) {
        eprintln!("navsim failed: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> NavConfig {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {path}: {e}");
        std::process::exit(1);
    });
    NavConfig::from_json(&text).unwrap_or_else(|e| {
        eprintln!("Failed to parse {path}: {e}");
        std::process::exit(1);
    })
}

fn run(config: NavConfig, options: &Options) -> canopy_nav::Result<()> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut nav = NavCoordinator::new(config);

    let east_x = ISLAND_SIZE as i32 + ISLAND_GAP;
    nav.add_graph(
        GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), ISLAND_SIZE, ISLAND_SIZE)),
        "west",
    )?;
    nav.add_graph(
        GraphKind::Grid(GridGraphSettings::new(
            VoxelCoord::new(east_x, 0, 0),
            ISLAND_SIZE,
            ISLAND_SIZE,
        )),
        "east",
    )?;
    nav.scan(None)?;

    for z in (0..ISLAND_SIZE as i32).step_by(8) {
        nav.add_link(LinkSource::new(
            VoxelCoord::new(ISLAND_SIZE as i32 - 1, 0, z),
            VoxelCoord::new(east_x, 0, z),
        ));
    }
    nav.flush_work_items()?;
    info!(graphs = nav.graph_count(), links = nav.link_count(), "navsim.world_ready");

    let tally = Arc::new(Tally::default());
    let search = nav.search_handle();
    let extent = east_x + ISLAND_SIZE as i32;
    let started = Instant::now();

    for frame in 0..options.frames {
        for _ in 0..options.paths_per_frame {
            let start = VoxelCoord::new(rng.gen_range(0..extent), 0, rng.gen_range(0..ISLAND_SIZE as i32));
            let goal = VoxelCoord::new(rng.gen_range(0..extent), 0, rng.gen_range(0..ISLAND_SIZE as i32));
            let tally = tally.clone();
            search.submit(
                PathRequest::new(start, goal),
                move |_, outcome| {
                    let counter = match outcome {
                        PathOutcome::Found(_) => &tally.found,
                        PathOutcome::NoPath => &tally.no_path,
                        PathOutcome::NoStartNode | PathOutcome::NoGoalNode => &tally.unsnapped,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                },
            );
        }

        if rng.gen_bool(0.25) {
            let cell = VoxelCoord::new(rng.gen_range(0..extent), 0, rng.gen_range(0..ISLAND_SIZE as i32));
            nav.update_graphs(GraphUpdate::new(Aabb::from_point(cell)).walkable(rng.gen_bool(0.5)));
        }

        if options.rescan_every > 0 && frame > 0 && frame % options.rescan_every == 0 {
            // Drop the iterator at once; `update()` steps the scan from here.
            let _ = nav.scan_async(None)?;
        }

        nav.update()?;
        if nav.config().search_threads == 0 {
            nav.process_paths_inline();
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    nav.shutdown()?;
    let stats = nav.stats();
    println!("frames:              {}", options.frames);
    println!("elapsed:             {:.2?}", started.elapsed());
    println!("paths found:         {}", tally.found.load(Ordering::Relaxed));
    println!("paths without route: {}", tally.no_path.load(Ordering::Relaxed));
    println!("paths unsnapped:     {}", tally.unsnapped.load(Ordering::Relaxed));
    println!("scans completed:     {}", stats.scans_completed);
    println!("batches completed:   {}", stats.batches_completed);
    println!("link refreshes:      {}", stats.link_refreshes);
    println!("links reconnected:   {}", stats.links_reconnected);
    Ok(())
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> Options {
    let mut options = Options::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                options.config = args.get(i).cloned().or_else(|| {
                    eprintln!("--config requires a path");
                    std::process::exit(1);
                });
            }
            "--frames" => {
                i += 1;
                options.frames = parse_number(&args, i, "--frames");
            }
            "--seed" => {
                i += 1;
                options.seed = parse_number(&args, i, "--seed");
            }
            "--paths-per-frame" => {
                i += 1;
                options.paths_per_frame = parse_number(&args, i, "--paths-per-frame");
            }
            "--rescan-every" => {
                i += 1;
                options.rescan_every = parse_number(&args, i, "--rescan-every");
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn parse_number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
        eprintln!("{flag} requires a valid number");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: navsim [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <PATH>          NavConfig JSON file (default: built-in defaults)");
    println!("  --frames <N>             Frames to run (default: 600)");
    println!("  --seed <N>               RNG seed (default: 1)");
    println!("  --paths-per-frame <N>    Path requests submitted per frame (default: 8)");
    println!("  --rescan-every <N>       Cooperative rescan every N frames, 0 = never (default: 120)");
    println!("  --help, -h               Show this help");
}
