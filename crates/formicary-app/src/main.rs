use anyhow::{Context, Result, bail};
use clap::Parser;
use formicary_cluster::transport::{MasterLink, WorkerLink};
use formicary_cluster::{Master, Worker, geometry_of};
use formicary_core::{Rgb, SeedImage, SimConfig, TickOutcome, World, WorldOptions};
use formicary_render::render_frame;
use formicary_storage::{Recording, TickSample, TimeInfo};
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match (&cli.listen, &cli.connect) {
        (Some(listen), None) => {
            let workers = cli.workers.unwrap_or(1);
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            run_master(&config, listen, workers)
        }
        (None, Some(connect)) => run_worker(&config, connect),
        (None, None) => run_single(&config),
        (Some(_), Some(_)) => unreachable!("clap rejects --listen with --connect"),
    }
}

#[derive(Parser, Debug)]
#[command(name = "formicary", version, about = "Competing ant colony simulator")]
struct Cli {
    /// Path to the TOML configuration document.
    #[arg(default_value = "antconfig.toml")]
    config: PathBuf,
    /// Run as the distributed master, listening for workers on this address.
    #[arg(long, value_name = "ADDR", conflicts_with = "connect")]
    listen: Option<String>,
    /// Number of workers the master waits for before starting.
    #[arg(long, value_name = "N", requires = "listen")]
    workers: Option<usize>,
    /// Run as a distributed worker, connecting to a master.
    #[arg(long, value_name = "ADDR")]
    connect: Option<String>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: &Path) -> Result<SimConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let config: SimConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse configuration {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn decode_seed_image(path: &Path) -> Result<SeedImage> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode seed image {}", path.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    let pixels = decoded
        .pixels()
        .map(|pixel| Rgb::new(pixel.0[0], pixel.0[1], pixel.0[2]))
        .collect();
    SeedImage::new(width as i32, height as i32, pixels)
        .with_context(|| format!("seed image {} is unusable", path.display()))
}

fn load_random_buffer(path: &Path) -> Result<Vec<f64>> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read random resource {}", path.display()))?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}

fn build_world(config: &SimConfig, options: WorldOptions) -> Result<World> {
    let seed_image = decode_seed_image(Path::new(&config.simulation.grid_file))?;
    let random_buffer = load_random_buffer(Path::new(&config.simulation.random_file))?;
    let world = World::from_seed(&seed_image, random_buffer, config.clone(), options)?;
    info!(
        width = world.width(),
        height = world.height(),
        colonies = world.colonies().len(),
        rng_seed = world.rng_seed(),
        "world initialised"
    );
    Ok(world)
}

fn open_recording(config: &SimConfig) -> Recording {
    if config.simulation.recording_enabled {
        Recording::create(&config.simulation.output_prefix)
    } else {
        info!("recording disabled by configuration");
        Recording::disabled()
    }
}

/// Wall-clock and simulation-only timing plus the per-tick population series.
struct RunTimer {
    wall_start: Instant,
    sim_ms: f64,
    samples: Vec<TickSample>,
}

impl RunTimer {
    fn start() -> Self {
        Self {
            wall_start: Instant::now(),
            sim_ms: 0.0,
            samples: Vec::new(),
        }
    }

    fn record(&mut self, outcome: &TickOutcome, tick_ms: f64) {
        self.sim_ms += tick_ms;
        self.samples.push(TickSample {
            num_ants: outcome.alive_ants,
            time_ms: self.sim_ms,
        });
    }

    fn wall_ms(&self) -> f64 {
        self.wall_start.elapsed().as_secs_f64() * 1000.0
    }
}

fn finish_run(
    world: &World,
    mut recording: Recording,
    timer: &RunTimer,
    ticks_done: u32,
) {
    recording.write_stats(
        ticks_done,
        TimeInfo::from_ticks(ticks_done, timer.wall_ms()),
        TimeInfo::from_ticks(ticks_done, timer.sim_ms),
    );
    recording.write_ant_series(&timer.samples);
    recording.finalise();
    info!(
        ticks = ticks_done,
        surviving_colonies = world.surviving_colonies(),
        max_ants_alive = world.max_ants_alive(),
        "simulation done"
    );
}

fn run_single(config: &SimConfig) -> Result<()> {
    let mut world = build_world(config, WorldOptions::default())?;
    let mut recording = open_recording(config);
    let mut timer = RunTimer::start();

    let mut ticks_done = 0;
    for tick_index in 0..config.simulation.simulate_ticks {
        let tick_start = Instant::now();
        let outcome = world.step();
        timer.record(&outcome, tick_start.elapsed().as_secs_f64() * 1000.0);
        ticks_done = tick_index + 1;

        let frame = render_frame(&world);
        recording.append_frame(
            u64::from(tick_index),
            world.width() as u32,
            world.height() as u32,
            &frame,
        );

        if let Some(reason) = outcome.halt {
            info!(tick = outcome.tick.0, %reason, "halting early");
            break;
        }
    }

    finish_run(&world, recording, &timer, ticks_done);
    Ok(())
}

fn run_master(config: &SimConfig, listen: &str, workers: usize) -> Result<()> {
    let mut world = build_world(config, WorldOptions::for_rank(0))?;
    let listener = TcpListener::bind(listen)
        .with_context(|| format!("failed to listen on {listen}"))?;
    info!(%listen, workers, "waiting for workers");
    let link = MasterLink::accept(&listener, workers, geometry_of(&world))?;
    let mut master = Master::new(&world, link)?;

    let mut recording = open_recording(config);
    let mut timer = RunTimer::start();

    let mut ticks_done = 0;
    for tick_index in 0..config.simulation.simulate_ticks {
        let tick_start = Instant::now();
        let outcome = master.tick(&mut world)?;
        timer.record(&outcome, tick_start.elapsed().as_secs_f64() * 1000.0);
        ticks_done = tick_index + 1;

        let frame = render_frame(&world);
        recording.append_frame(
            u64::from(tick_index),
            world.width() as u32,
            world.height() as u32,
            &frame,
        );

        if let Some(reason) = outcome.halt {
            info!(tick = outcome.tick.0, %reason, "halting early");
            break;
        }
    }
    master.shutdown()?;

    finish_run(&world, recording, &timer, ticks_done);
    Ok(())
}

fn run_worker(config: &SimConfig, connect: &str) -> Result<()> {
    // the rank is only known after the handshake, and it partitions the ant
    // id space, so the provisional world is rebuilt once the welcome arrives
    let provisional = build_world(config, WorldOptions::for_rank(0))?;
    let link = WorkerLink::connect(connect, geometry_of(&provisional))
        .with_context(|| format!("failed to join master at {connect}"))?;
    let rank = link.rank();
    let mut world = World::from_seed(
        &decode_seed_image(Path::new(&config.simulation.grid_file))?,
        load_random_buffer(Path::new(&config.simulation.random_file))?,
        config.clone(),
        WorldOptions::for_rank(rank),
    )?;
    let mut worker = Worker::new(&world, link)?;
    info!(rank, "worker running");
    worker.run(&mut world)?;
    info!(rank, "worker finished");
    Ok(())
}
