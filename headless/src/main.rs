use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use console::style;
use indicatif::ProgressStyle;
use radium::scene::{
    AnimationSystem, CounterComponent, DummySystem, SkeletonData, SkinningSystem, procedural_file,
};
use radium::{Engine, EngineConfig, Execution, FrameReport};
use tracing_indicatif::IndicatifLayer;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    /// Run tasks on the worker pool.
    Parallel,
    /// Run tasks on the main thread.
    Inline,
}

/// Runs engine frames without a window.
#[derive(Parser, Debug, Clone)]
struct Args {
    /// Number of frames to run.
    #[clap(long, default_value_t = 120)]
    frames: u64,

    /// Target frame rate. Also sets the constant time step.
    #[clap(long, default_value_t = 60.0)]
    fps: f64,

    /// Do not wait between frames.
    #[clap(long)]
    unpaced: bool,

    /// Worker threads, defaults to the configuration or the core count.
    #[clap(long)]
    workers: Option<usize>,

    /// JSON engine configuration.
    #[clap(long)]
    config: Option<Utf8PathBuf>,

    #[clap(value_enum, long, default_value = "parallel")]
    mode: Mode,

    /// Animated skeletons in the procedural scene.
    #[clap(long, default_value_t = 4)]
    arms: usize,

    /// Bones per skeleton.
    #[clap(long, default_value_t = 6)]
    bones: usize,

    /// Write the first frame's task graph in dot format.
    #[clap(long)]
    dot: Option<Utf8PathBuf>,

    /// Write a waterfall chart of the last frame as SVG.
    #[clap(long)]
    waterfall: Option<Utf8PathBuf>,

    /// Print the timing table of the last frame.
    #[clap(long)]
    report: bool,
}

fn init_tracing() {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::try_from_env("RADIUM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if args.workers.is_some() {
        config.queue.workers = args.workers;
    }

    let fps = args.fps.max(1.0);
    let frame_time = Duration::from_secs_f64(1.0 / fps);

    let mut engine = Engine::new(config)?;
    engine.register_system(SkinningSystem::NAME, SkinningSystem::new(), 10)?;
    engine.register_system(AnimationSystem::NAME, AnimationSystem::new(), 5)?;
    engine.register_system(DummySystem::NAME, DummySystem::new(), 0)?;

    let file = procedural_file("procedural/robot", args.arms, args.bones);
    let duration = file
        .items::<SkeletonData>()
        .flat_map(|skeleton| skeleton.bones.iter().map(|bone| bone.track.last_time()))
        .fold(0.0_f32, f32::max);
    engine.load_file(&file)?;

    let time = engine.time_mut();
    time.set_constant_time_step(1.0 / fps);
    time.set_end_time(Some(f64::from(duration)));
    time.set_auto_repeat(true);
    time.play(true);

    if let Some(path) = &args.dot {
        std::fs::write(path, engine.task_graph()?)?;
        println!("{} {}", style("Task graph").cyan(), path);
    }

    let execution = match args.mode {
        Mode::Parallel => Execution::Parallel,
        Mode::Inline => Execution::Inline,
    };

    let stats = run(&mut engine, &args, execution, frame_time)?;
    stats.print(&engine, args.frames);

    if let Some(last) = &stats.last {
        if let Some(path) = &args.waterfall {
            last.write_waterfall(path)?;
            println!("{} {}", style("Waterfall").cyan(), path);
        }
        if args.report {
            print!("{last}");
        }
    }

    Ok(())
}

#[derive(Default)]
struct Stats {
    tasks: usize,
    failures: usize,
    busy: Duration,
    slowest: Duration,
    elapsed: Duration,
    last: Option<FrameReport>,
}

fn run(engine: &mut Engine, args: &Args, execution: Execution, frame_time: Duration) -> anyhow::Result<Stats> {
    let span = tracing::info_span!("frames");
    span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    span.pb_set_length(args.frames);
    span.pb_set_message("Running frames...");
    let _enter = span.enter();

    let mut stats = Stats::default();
    let start = Instant::now();

    for _ in 0..args.frames {
        let frame_start = Instant::now();
        let report = engine.frame_with(execution)?;

        stats.tasks += report.executed();
        stats.failures += report.failures.len();
        stats.busy += report.busy_time();
        stats.slowest = stats.slowest.max(report.elapsed);
        stats.last = Some(report);
        span.pb_inc(1);

        if !args.unpaced {
            thread::sleep(frame_time.saturating_sub(frame_start.elapsed()));
        }
    }

    stats.elapsed = start.elapsed();
    Ok(stats)
}

impl Stats {
    fn print(&self, engine: &Engine, frames: u64) {
        let registry = engine.registry();
        let counted: u64 = registry
            .components_of_system(DummySystem::NAME)
            .into_iter()
            .filter_map(|id| registry.with_component::<CounterComponent, _>(id, |c| c.count).ok())
            .sum();

        let average = average_frame_time(self.elapsed, frames);

        println!(
            "{} {} frames, {} tasks, {} failed",
            style("Done").green().bold(),
            frames,
            self.tasks,
            self.failures
        );
        println!(
            "  {} {:.2?} wall, {:.2?} per frame, {:.2?} slowest, {:.2?} in tasks",
            style("time").dim(),
            self.elapsed,
            average,
            self.slowest,
            self.busy
        );
        println!(
            "  {} {} workers, {} entities, {} components, {} counter ticks",
            style("engine").dim(),
            engine.pool().workers(),
            registry.entity_count(),
            registry.component_count(),
            counted
        );
    }
}

fn average_frame_time(elapsed: Duration, frames: u64) -> Duration {
    match frames {
        0 => Duration::ZERO,
        n => elapsed.div_f64(n as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_frame_time() {
        let elapsed = Duration::from_secs(2);
        assert_eq!(average_frame_time(elapsed, 0), Duration::ZERO);
        assert_eq!(average_frame_time(elapsed, 4), Duration::from_millis(500));
        // Counts past u32::MAX must not wrap to a zero divisor.
        let huge = average_frame_time(elapsed, 1 << 32);
        assert!(huge < Duration::from_micros(1));
    }
}
