use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use motif_core::{
    player::RawPcmOutput,
    AppConfig, AudioOutput, ExportPipeline, InputKind, Key, MappingRules, Mode, Pacing,
    PitchAssetCache, PlayState, Player, ShareState, TraceRenderer, VisualOutcome,
};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "device")]
use motif_core::player::DeviceOutput;

fn main() -> motif_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Plan { input } => run_plan(&input),
        Commands::Play { input, raw } => run_play(&config, &input, raw),
        Commands::Export { input, out } => run_export(&config, &input, &out),
        Commands::Share { input, base } => run_share(&input, base.as_deref()),
    }
}

fn run_plan(input: &InputArgs) -> motif_core::Result<()> {
    let state = input.resolve()?;
    let plan = state.build_plan();
    tracing::info!(
        events = plan.events().len(),
        total = ?plan.total_duration(),
        "plan built"
    );
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn run_play(config: &AppConfig, input: &InputArgs, raw: bool) -> motif_core::Result<()> {
    let state = input.resolve()?;
    let plan = Arc::new(state.build_plan());
    let mut config = config.clone();
    let output: Box<dyn AudioOutput> = if raw {
        Box::new(RawPcmOutput::stdout())
    } else {
        device_output(&mut config)
    };
    let assets = Arc::new(PitchAssetCache::from_config(&config.assets, config.audio.sample_rate));

    let mut player = Player::from_config(&config, assets, Pacing::Realtime, output);
    tracing::info!(source = %state.source_text(), "starting playback");
    if let PlayState::Nothing = player.play(plan, TraceRenderer::new())? {
        tracing::warn!("input produced no events");
        return Ok(());
    }
    player.unlock()?;

    match player.wait()? {
        Some(VisualOutcome::Completed(snapshot)) => {
            tracing::info!(caption = %snapshot.caption, events = snapshot.revealed, "playback finished")
        }
        Some(VisualOutcome::Cancelled { revealed }) => {
            tracing::warn!(revealed, "playback cancelled")
        }
        None => {}
    }
    player.shutdown()
}

#[cfg(feature = "device")]
fn device_output(config: &mut AppConfig) -> Box<dyn AudioOutput> {
    if let Some(rate) = DeviceOutput::preferred_sample_rate() {
        if rate != config.audio.sample_rate {
            tracing::info!(from = config.audio.sample_rate, to = rate, "using the device sample rate");
            config.audio.sample_rate = rate;
        }
    }
    Box::new(DeviceOutput::new(config.audio.sample_rate))
}

#[cfg(not(feature = "device"))]
fn device_output(_config: &mut AppConfig) -> Box<dyn AudioOutput> {
    tracing::warn!("built without the `device` feature, audio is discarded; use --raw to pipe it");
    Box::new(motif_core::player::NullOutput)
}

fn run_export(config: &AppConfig, input: &InputArgs, out: &Path) -> motif_core::Result<()> {
    let state = input.resolve()?;
    let plan = Arc::new(state.build_plan());
    let assets = Arc::new(PitchAssetCache::from_config(&config.assets, config.audio.sample_rate));
    let pipeline = ExportPipeline::from_config(config, assets)?;

    let outcome = pipeline.export(&plan, &state.value)?;
    if !outcome.preload.failed.is_empty() {
        tracing::warn!(missing = ?outcome.preload.failed, "some pitches are silent in the export");
    }
    std::fs::create_dir_all(out)?;
    let path = outcome.write_to(out)?;
    tracing::info!(
        path = %path.display(),
        state = ?outcome.state,
        format = %outcome.format,
        "export written"
    );
    println!("{}", path.display());
    Ok(())
}

fn run_share(input: &InputArgs, base: Option<&str>) -> motif_core::Result<()> {
    let state = input.resolve()?;
    match base {
        Some(base) => println!("{}", state.to_url(&url_base(base)?)),
        None => println!("{}", state.to_query()),
    }
    Ok(())
}

fn url_base(base: &str) -> motif_core::Result<url::Url> {
    Ok(url::Url::parse(base)?)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turn text, dates and phone numbers into music", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the timeline plan as JSON.
    Plan {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Play the input on the sound card, logging captions as they appear.
    Play {
        #[command(flatten)]
        input: InputArgs,
        /// Stream raw f32 little-endian mono samples to stdout.
        #[arg(long)]
        raw: bool,
    },
    /// Render the input into a video file.
    Export {
        #[command(flatten)]
        input: InputArgs,
        /// Directory the artifact is written to.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Print the shareable parameters for the input.
    Share {
        #[command(flatten)]
        input: InputArgs,
        /// Base URL to attach the parameters to.
        #[arg(long)]
        base: Option<String>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Text, date or phone number to play.
    value: Option<String>,
    /// Read everything from a shared query string instead.
    #[arg(long, conflicts_with_all = ["value", "kind", "key", "mode"])]
    share: Option<String>,
    #[arg(long, default_value = "text")]
    kind: InputKind,
    #[arg(long, default_value = "C")]
    key: Key,
    #[arg(long, default_value = "major")]
    mode: Mode,
}

impl InputArgs {
    fn resolve(&self) -> motif_core::Result<ShareState> {
        if let Some(query) = &self.share {
            return Ok(ShareState::from_query(query));
        }
        let value = self
            .value
            .as_deref()
            .ok_or_else(|| motif_core::MotifError::msg("no input given; pass a value or --share"))?;
        Ok(ShareState::new(
            self.kind,
            value,
            MappingRules::new(self.key, self.mode),
        ))
    }
}
