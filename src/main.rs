//! Kaleido: GPU-effect video clip processor CLI.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kaleido::bridge::{BridgeStrategy, WgpuBridge};
use kaleido::codec::{EncoderStage, FfmpegDecoder, FfmpegEncoder};
use kaleido::config::{load_shaders, EffectSettings};
use kaleido::mux::FfmpegMuxer;
use kaleido::pipeline::{
    event_channel, CancelToken, Pipeline, PipelineConfig, PipelineEvent, RunResult,
};
use kaleido::source::{probe, toolkit_available, FfmpegSampleSource};
use std::path::PathBuf;
use std::thread;
use tracing::info;

/// Apply a GPU per-pixel effect to a video clip and re-encode it.
#[derive(Parser, Debug)]
#[command(name = "kaleido")]
#[command(about = "Apply GPU effects to video clips")]
struct Args {
    /// Input video file
    input: PathBuf,

    /// Output video file
    #[arg(short, long, default_value = "out.mp4")]
    output: PathBuf,

    /// Effect settings YAML file
    #[arg(short = 'c', long)]
    effect_config: Option<PathBuf>,

    /// Effect strength, 0.0 to 1.0
    #[arg(long)]
    strength: Option<f32>,

    /// Mosaic cell size in pixels
    #[arg(long)]
    cell_size: Option<f32>,

    /// Palette entries as #rrggbb hex colors
    #[arg(long, num_args = 1..)]
    palette: Vec<String>,

    /// Path to extra GLSL or WGSL fragment shader file(s)
    #[arg(short, long, num_args = 1..)]
    shader: Vec<PathBuf>,

    /// Probe the input and exit without processing
    #[arg(long)]
    probe_only: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if !toolkit_available() {
        bail!("ffmpeg not found on PATH; install it and retry");
    }

    let desc = probe(&args.input)
        .with_context(|| format!("failed to probe '{}'", args.input.display()))?;
    info!(
        "input: {}x{} @ {}/{} fps, ~{} frames",
        desc.width,
        desc.height,
        desc.fps_num,
        desc.fps_den,
        desc.total_frames_estimate()
    );

    if args.probe_only {
        println!(
            "{}x{} @ {:.3} fps, {:.2}s, ~{} frames",
            desc.width,
            desc.height,
            desc.fps(),
            desc.duration_us as f64 / 1_000_000.0,
            desc.total_frames_estimate()
        );
        return Ok(());
    }

    let mut settings = match &args.effect_config {
        Some(path) => EffectSettings::load(path)
            .with_context(|| format!("failed to load '{}'", path.display()))?,
        None => EffectSettings::default(),
    };
    if let Some(strength) = args.strength {
        settings.strength = strength;
    }
    if let Some(cell_size) = args.cell_size {
        settings.cell_size = cell_size;
    }
    if !args.palette.is_empty() {
        settings.palette = args.palette.clone();
    }

    let uniforms = settings.to_uniforms(desc.width, desc.height)?;
    let shaders = load_shaders(&args.shader)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("received interrupt signal, cancelling...");
        handler_token.cancel();
    })?;

    let source = FfmpegSampleSource::open(&args.input, desc.clone())?;
    let decoder = FfmpegDecoder::open(&desc)?;
    let encoder = FfmpegEncoder::open(&desc)?;
    let strategy = BridgeStrategy::detect(encoder.input_surface());
    let bridge = WgpuBridge::new(&desc, uniforms, shaders, strategy)?;
    let muxer = FfmpegMuxer::new(&args.output);

    let (publisher, events) = event_channel(16);
    let pipeline = Pipeline::new(
        source,
        decoder,
        bridge,
        encoder,
        muxer,
        args.output.clone(),
        PipelineConfig::default(),
        cancel,
    )
    .with_events(publisher);

    let worker = thread::spawn(move || pipeline.run());

    let mut result = None;
    for event in events {
        match event {
            PipelineEvent::Progress(p) => {
                let percent = if p.total_frames_estimate > 0 {
                    100.0 * p.frames_processed as f64 / p.total_frames_estimate as f64
                } else {
                    0.0
                };
                println!(
                    "processed {} frames ({percent:.0}%) in {:.1}s",
                    p.frames_processed,
                    p.elapsed.as_secs_f64()
                );
            }
            PipelineEvent::Finished(r) => {
                result = Some(r);
                break;
            }
        }
    }
    let _ = worker.join();

    match result {
        Some(RunResult::Success { output, elapsed }) => {
            println!("done: '{}' in {:.1}s", output.display(), elapsed.as_secs_f64());
            Ok(())
        }
        Some(RunResult::Cancelled) => {
            println!("cancelled; no output written");
            std::process::exit(130);
        }
        Some(RunResult::Failed { message }) => bail!("processing failed: {message}"),
        None => bail!("pipeline exited without reporting an outcome"),
    }
}
