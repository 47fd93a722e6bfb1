//! CLI command definitions for dataset-kurator.
//!
//! The binary is a thin shell over the library: it builds the runtime
//! configuration from `DSK_*` variables and flags, then drives the input
//! queue, the batch controller and the process log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::metrics::export_metrics;
use crate::pipeline::{JobConfig, PipelineConfig};
use crate::scheduler::{BatchController, BatchProgress, BatchStatus, InputQueue};
use crate::storage::ProcessLog;

/// Default interval between progress polls while a batch runs.
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Turns anime videos into captioned, classified image datasets.
#[derive(Parser)]
#[command(name = "dataset-kurator")]
#[command(about = "Turn videos into captioned image datasets")]
#[command(version)]
#[command(
    long_about = "dataset-kurator extracts frames from queued videos, removes duplicates and unusable frames, upscales, crops faces, captions and groups the result, then packages one zip archive per video.\n\nExample usage:\n  dataset-kurator enqueue episode-01.mp4\n  dataset-kurator run --trigger-word mika --skip-upscaling"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Place the input, work, output and logs directories under this root.
    #[arg(long, global = true, env = "DSK_ROOT")]
    pub root: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Copy videos into the input queue.
    Enqueue(EnqueueArgs),

    /// List queued videos.
    Queue(ListArgs),

    /// Process every queued video as one batch.
    Run(Box<RunArgs>),

    /// Print the process log of the most recent job.
    Log,

    /// List packaged archives.
    Results(ListArgs),
}

/// Arguments for `dataset-kurator enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Video files to queue.
    #[arg(required = true)]
    pub videos: Vec<PathBuf>,
}

/// Arguments for listing commands.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dataset-kurator run`.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Stage parameters as a JSON or YAML file; flags override its values.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Label every caption starts with.
    #[arg(short = 't', long)]
    pub trigger_word: Option<String>,

    /// Frames sampled per second of video.
    #[arg(long)]
    pub fps: Option<u32>,

    /// Maximum perceptual hash distance treated as a duplicate.
    #[arg(long)]
    pub dedup_threshold: Option<u32>,

    /// Upscaling factor.
    #[arg(long)]
    pub upscale_factor: Option<u32>,

    /// Minimum Laplacian variance of a kept frame.
    #[arg(long)]
    pub blur_variance_min: Option<f64>,

    /// Minimum mean brightness of a kept frame.
    #[arg(long)]
    pub brightness_min: Option<f64>,

    /// Margin added around each face, as a fraction of its size.
    #[arg(long)]
    pub crop_margin: Option<f64>,

    /// Minimum face detection confidence.
    #[arg(long)]
    pub detection_confidence: Option<f64>,

    /// Images per face detection call.
    #[arg(long)]
    pub detection_batch_size: Option<usize>,

    /// Minimum tag score included in a caption.
    #[arg(long)]
    pub tag_threshold: Option<f64>,

    #[arg(long)]
    pub skip_deduplication: bool,

    #[arg(long)]
    pub skip_filtering: bool,

    #[arg(long)]
    pub skip_upscaling: bool,

    #[arg(long)]
    pub skip_cropping: bool,

    #[arg(long)]
    pub skip_annotation: bool,

    #[arg(long)]
    pub skip_classification: bool,

    /// Load resources on first use instead of before each job.
    #[arg(long)]
    pub no_preload: bool,

    /// Milliseconds between progress polls.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Print the Prometheus metrics after the batch.
    #[arg(long)]
    pub metrics: bool,

    /// Output the final batch state as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl RunArgs {
    /// Builds the stage parameters from the optional file and the flags.
    pub fn job_config(&self) -> anyhow::Result<JobConfig> {
        let mut config = match &self.config {
            Some(path) => JobConfig::from_file(path)?,
            None => JobConfig::default(),
        };

        if let Some(word) = &self.trigger_word {
            config.trigger_word = word.clone();
        }
        if let Some(fps) = self.fps {
            config.frames_per_second = fps;
        }
        if let Some(threshold) = self.dedup_threshold {
            config.dedup_threshold = threshold;
        }
        if let Some(factor) = self.upscale_factor {
            config.upscale_factor = factor;
        }
        if let Some(min) = self.blur_variance_min {
            config.blur_variance_min = min;
        }
        if let Some(min) = self.brightness_min {
            config.brightness_min = min;
        }
        if let Some(margin) = self.crop_margin {
            config.crop_margin_fraction = margin;
        }
        if let Some(confidence) = self.detection_confidence {
            config.detection_confidence_min = confidence;
        }
        if let Some(size) = self.detection_batch_size {
            config.detection_batch_size = size;
        }
        if let Some(threshold) = self.tag_threshold {
            config.tag_threshold = threshold;
        }

        config.skip_deduplication |= self.skip_deduplication;
        config.skip_filtering |= self.skip_filtering;
        config.skip_upscaling |= self.skip_upscaling;
        config.skip_cropping |= self.skip_cropping;
        config.skip_annotation |= self.skip_annotation;
        config.skip_classification |= self.skip_classification;

        config.validate()?;
        Ok(config)
    }
}

/// One archive in the results directory.
#[derive(Debug, Serialize)]
struct ResultEntry {
    name: String,
    size_bytes: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Queue(args) => run_queue_command(&config, args),
        Commands::Run(args) => run_batch_command(config, *args).await,
        Commands::Log => run_log_command(&config).await,
        Commands::Results(args) => run_results_command(&config, args),
    }
}

async fn run_enqueue_command(config: &PipelineConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = InputQueue::new(&config.input_dir);
    for video in &args.videos {
        let queued = queue.enqueue(video).await?;
        println!("Queued {}", queued.display());
    }
    Ok(())
}

fn run_queue_command(config: &PipelineConfig, args: ListArgs) -> anyhow::Result<()> {
    let names = InputQueue::new(&config.input_dir).names()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else if names.is_empty() {
        println!("No videos queued");
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

async fn run_batch_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let preload = config.preload && !args.no_preload;
    let config = config.with_preload(preload);
    config.validate()?;
    let job_config = args.job_config()?;

    let controller = BatchController::from_config(&config);
    controller.start(job_config)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_interval_ms.max(1)));
    let mut last: Option<BatchProgress> = None;
    loop {
        ticker.tick().await;
        let state = controller.status();
        if last.as_ref() != Some(&state.progress) {
            info!(
                step = state.progress.step,
                total = state.progress.total,
                stage = %state.progress.name,
                job = state.progress.job.as_deref().unwrap_or("-"),
                "Progress"
            );
            last = Some(state.progress.clone());
        }
        if state.status != BatchStatus::Processing {
            break;
        }
    }

    let state = controller.wait().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("Batch {}", state.status);
        for name in &state.results {
            println!("  {}", config.results_dir.join(name).display());
        }
        if !state.queue.is_empty() {
            println!("Still queued: {}", state.queue.join(", "));
        }
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    if state.status == BatchStatus::Failed {
        anyhow::bail!(
            "Batch failed: {}",
            state.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_log_command(config: &PipelineConfig) -> anyhow::Result<()> {
    let text = ProcessLog::new(&config.log_dir).read().await?;
    print!("{}", text);
    Ok(())
}

fn run_results_command(config: &PipelineConfig, args: ListArgs) -> anyhow::Result<()> {
    let entries = list_results(&config.results_dir)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No results");
    } else {
        for entry in entries {
            println!("{:>12}  {}", entry.size_bytes, entry.name);
        }
    }
    Ok(())
}

fn list_results(dir: &Path) -> anyhow::Result<Vec<ResultEntry>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut results = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".zip") {
            continue;
        }
        results.push(ResultEntry {
            name,
            size_bytes: entry.metadata()?.len(),
        });
    }
    results.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["dataset-kurator", "run"]).expect("should parse");
        assert_eq!(cli.log_level, "info");

        match cli.command {
            Commands::Run(args) => {
                assert!(args.config.is_none());
                assert!(!args.json);
                assert_eq!(args.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
                assert_eq!(args.job_config().expect("config"), JobConfig::default());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "dataset-kurator",
            "run",
            "-t",
            "mika",
            "--fps",
            "2",
            "--skip-upscaling",
            "--skip-cropping",
            "--json",
        ])
        .expect("should parse");

        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        let config = args.job_config().expect("config");
        assert_eq!(config.trigger_word, "mika");
        assert_eq!(config.frames_per_second, 2);
        assert!(config.skip_upscaling);
        assert!(config.skip_cropping);
        assert!(!config.skip_annotation);
        assert!(args.json);
    }

    #[test]
    fn test_run_config_file_with_flag_override() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("job.yaml");
        std::fs::write(&path, "triggerWord: rin\nupscaleFactor: 2\n").expect("write");

        let args = RunArgs {
            config: Some(path),
            upscale_factor: Some(3),
            ..RunArgs::default()
        };
        let config = args.job_config().expect("config");
        assert_eq!(config.trigger_word, "rin");
        assert_eq!(config.upscale_factor, 3);
    }

    #[test]
    fn test_run_rejects_invalid_flags() {
        let args = RunArgs {
            fps: Some(0),
            ..RunArgs::default()
        };
        assert!(args.job_config().is_err());
    }

    #[test]
    fn test_enqueue_requires_a_video() {
        assert!(Cli::try_parse_from(["dataset-kurator", "enqueue"]).is_err());
        let cli = Cli::try_parse_from(["dataset-kurator", "enqueue", "a.mp4", "b.mp4"])
            .expect("should parse");
        match cli.command {
            Commands::Enqueue(args) => assert_eq!(args.videos.len(), 2),
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_list_results_only_archives() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("b.zip"), b"zip").expect("write");
        std::fs::write(dir.path().join("a.zip"), b"zipzip").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");

        let entries = list_results(dir.path()).expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.zip", "b.zip"]);
        assert_eq!(entries[0].size_bytes, 6);

        assert!(list_results(&dir.path().join("missing"))
            .expect("missing dir")
            .is_empty());
    }
}
