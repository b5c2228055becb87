//! subsample - explore how the subsampling engine tiles a large image.
//!
//! `inspect` prints image metadata and the sample-size pyramid; `simulate`
//! drives a zoom sequence through the engine and logs every settled
//! snapshot.

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subsampling_engine::{
    config::{Cli, Command, EngineArgs, ImageArgs, InspectConfig, OutputFormat, SimulateConfig},
    decode::{encode_synthetic, DecoderRegistry, ImageInfo},
    io::{FileImageSource, ImageSource, MemoryImageSource},
    tile::{
        build_grid, decide, grid_sample_sizes, ExifOrientation, IntSize, LoadState, TileCache,
        TileManager, TileSnapshotSet, Viewport,
    },
    CoreEvent, SubsamplingCore,
};

/// How long `simulate` waits for one zoom step to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Quiet period after which a viewport without tiles counts as settled.
const IDLE_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Inspect(config) => run_inspect(config).await,
        Command::Simulate(config) => run_simulate(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "subsampling_engine=debug,subsample=debug"
    } else {
        "subsampling_engine=info,subsample=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the image source selected on the command line.
fn image_source(args: &ImageArgs) -> Option<Arc<dyn ImageSource>> {
    match (&args.path, args.synthetic) {
        (_, Some(size)) => Some(Arc::new(MemoryImageSource::new(
            format!("synthetic-{}", size),
            encode_synthetic(size.width, size.height, ExifOrientation::Normal),
        ))),
        (Some(path), None) => Some(Arc::new(FileImageSource::new(path.clone()))),
        (None, None) => None,
    }
}

/// Validate engine flags, logging the reason on failure.
fn validated_config(args: &EngineArgs) -> Option<subsampling_engine::EngineConfig> {
    let config = args.engine_config();
    match config.validate() {
        Ok(()) => Some(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            None
        }
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

#[derive(Debug, Serialize)]
struct InspectReport {
    key: String,
    image: ImageInfo,
    display_size: IntSize,
    viewport: IntSize,
    content_size: IntSize,
    fit_sample_size: u32,
    subsampling: bool,
    levels: Vec<LevelReport>,
}

#[derive(Debug, Serialize)]
struct LevelReport {
    sample_size: u32,
    decoded_size: IntSize,
    tile_size: IntSize,
    cols: u32,
    rows: u32,
    tiles: usize,
}

async fn run_inspect(config: InspectConfig) -> ExitCode {
    init_logging(config.engine.verbose);

    let Some(engine_config) = validated_config(&config.engine) else {
        return ExitCode::FAILURE;
    };
    let Some(source) = image_source(&config.image) else {
        error!("No image given: pass a path or --synthetic WxH");
        return ExitCode::FAILURE;
    };
    let key = source.key().to_string();

    let cache = Arc::new(TileCache::with_capacities(
        engine_config.cache_bytes,
        engine_config.buffer_pool_bytes,
    ));
    let registry = Arc::new(DecoderRegistry::for_config(&engine_config));
    let mut manager = TileManager::new(engine_config.clone(), cache, registry);
    let info = match manager.set_image(source).await {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to open {}: {}", key, e);
            return ExitCode::FAILURE;
        }
    };
    manager.destroy();

    let report = build_report(key, info, config.engine.viewport, engine_config.max_tile_bytes);
    match config.format {
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        },
        OutputFormat::Text => print_report(&report),
    }

    ExitCode::SUCCESS
}

fn build_report(key: String, info: ImageInfo, viewport: IntSize, max_tile_bytes: usize) -> InspectReport {
    let display = info.display_size();
    let fitted = Viewport::fit(viewport, display);

    // Grids live in source space
    let to_source = |size: IntSize| {
        if info.orientation.swaps_dimensions() {
            size.transposed()
        } else {
            size
        }
    };
    let image = info.size();
    let container = to_source(viewport);
    let decision = decide(image, to_source(fitted.content_size), container, 1.0, max_tile_bytes);

    let levels = grid_sample_sizes(image, container)
        .into_iter()
        .map(|sample_size| {
            let grid = build_grid(image, sample_size, container);
            LevelReport {
                sample_size,
                decoded_size: image.sampled(sample_size),
                tile_size: grid.tile_size,
                cols: grid.cols,
                rows: grid.rows,
                tiles: grid.len(),
            }
        })
        .collect();

    InspectReport {
        key,
        display_size: display,
        viewport,
        content_size: fitted.content_size,
        fit_sample_size: decision.sample_size,
        subsampling: decision.subsampling,
        levels,
        image: info,
    }
}

fn print_report(report: &InspectReport) {
    println!("Image: {}", report.key);
    println!("═════════════════════════════════");
    println!("  Type:          {}", report.image.mime_type);
    println!("  Size:          {}", report.image.size());
    println!(
        "  Orientation:   {} ({:?})",
        report.image.orientation.to_exif(),
        report.image.orientation
    );
    println!("  Display size:  {}", report.display_size);
    println!("  Viewport:      {}", report.viewport);
    println!("  Content size:  {}", report.content_size);
    println!(
        "  Fit sample:    {}{}",
        report.fit_sample_size,
        if report.subsampling {
            ""
        } else {
            " (single full-image decode)"
        }
    );
    println!();

    if report.levels.is_empty() {
        println!("Image fits the viewport; no tiling needed.");
        return;
    }

    println!("  Sample   Decoded        Tile         Grid      Tiles");
    println!("  ──────   ────────────   ──────────   ───────   ─────");
    for level in report.levels.iter().rev() {
        println!(
            "  {:>6}   {:<12}   {:<10}   {:<7}   {:>5}",
            level.sample_size,
            level.decoded_size.to_string(),
            level.tile_size.to_string(),
            format!("{}x{}", level.cols, level.rows),
            level.tiles
        );
    }
}

// =============================================================================
// Simulate Command
// =============================================================================

async fn run_simulate(config: SimulateConfig) -> ExitCode {
    init_logging(config.engine.verbose);

    let Some(engine_config) = validated_config(&config.engine) else {
        return ExitCode::FAILURE;
    };
    let Some(source) = image_source(&config.image) else {
        error!("No image given: pass a path or --synthetic WxH");
        return ExitCode::FAILURE;
    };

    let core = match SubsamplingCore::spawn_default(engine_config) {
        Ok(core) => core,
        Err(e) => {
            error!("Failed to start engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut events = core.events();
    let info = match core.set_image(source).await {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to open image: {}", e);
            core.destroy().await;
            return ExitCode::FAILURE;
        }
    };

    let base = Viewport::fit(config.engine.viewport, info.display_size());
    info!(
        image = %info.size(),
        viewport = %base.container_size,
        content = %base.content_size,
        steps = config.steps,
        "Starting zoom simulation"
    );

    let mut snapshots = core.snapshots();
    let mut version = snapshots.borrow().version;
    let mut failed_tiles = 0usize;

    for step in 1..=config.steps {
        let scale = 2f32.powi(step as i32);
        if let Err(e) = core.update_viewport(base.zoomed(scale)) {
            error!("Engine stopped unexpectedly: {}", e);
            return ExitCode::FAILURE;
        }

        let set = wait_settled(&mut snapshots, version, SETTLE_TIMEOUT).await;
        version = set.version;

        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::TileFailed { coordinate, error } => {
                    failed_tiles += 1;
                    warn!(col = coordinate.col, row = coordinate.row, "Tile failed: {}", error);
                }
                CoreEvent::ImageFailed(e) => warn!("Image unavailable for tiling: {}", e),
                _ => {}
            }
        }

        let loaded = set
            .foreground_tiles
            .iter()
            .filter(|tile| tile.load_state == LoadState::Loaded)
            .count();
        info!(
            step,
            scale,
            sample_size = set.sample_size,
            foreground = set.foreground_tiles.len(),
            loaded,
            background = set.background_tiles.len(),
            load_rect = %set.image_load_rect,
            version = set.version,
            "Snapshot"
        );
    }

    core.destroy().await;
    info!(state = %core.state(), failed_tiles, "Simulation finished");
    ExitCode::SUCCESS
}

/// Wait for a snapshot newer than `after` whose foreground has settled.
///
/// Gives up after `timeout`, or once nothing has been published for
/// [`IDLE_GRACE`] while no tiles are wanted.
async fn wait_settled(
    snapshots: &mut watch::Receiver<TileSnapshotSet>,
    after: u64,
    timeout: Duration,
) -> TileSnapshotSet {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let set = snapshots.borrow_and_update();
            if set.version > after && is_settled(&set) {
                return set.clone();
            }
        }
        match tokio::time::timeout(IDLE_GRACE, snapshots.changed()).await {
            Ok(Ok(())) => {}
            // Engine gone
            Ok(Err(_)) => break,
            Err(_) => {
                if snapshots.borrow().foreground_tiles.is_empty() {
                    break;
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Snapshot did not settle within {:?}", timeout);
            break;
        }
    }
    let current = snapshots.borrow().clone();
    current
}

fn is_settled(set: &TileSnapshotSet) -> bool {
    set.background_tiles.is_empty()
        && set
            .foreground_tiles
            .iter()
            .all(|tile| matches!(tile.load_state, LoadState::Loaded | LoadState::Error))
}
