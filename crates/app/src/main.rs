use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use waveform_thumbnail_core::{
    AppConfig, AudioSource, SourceMonitor, ThumbnailCache, ThumbnailError, ThumbnailImage,
    ThumbnailListener, TimeSliceThread, WavThumbnail,
};

fn main() -> waveform_thumbnail_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            input,
            output,
            config,
            resolution,
            samples_per_pixel,
            timeout_secs,
        } => {
            let mut config = match config {
                Some(path) => AppConfig::load(path)?,
                None => AppConfig::default(),
            };
            if let Some(resolution) = resolution {
                config.thumbnail.resolution = resolution;
            }
            if let Some(samples) = samples_per_pixel {
                config.thumbnail.samples_per_thumbnail_sample = samples;
            }
            config.validate()?;
            run_render(&input, &output, &config, Duration::from_secs(timeout_secs))
        }
        Commands::Info { input } => run_info(&input),
    }
}

fn run_render(
    input: &Path,
    output: &Path,
    config: &AppConfig,
    timeout: Duration,
) -> waveform_thumbnail_core::Result<()> {
    tracing::info!(?input, ?output, "rendering waveform thumbnail");

    let thread = Arc::new(TimeSliceThread::new(config.scheduler.thread_name.clone()));
    let monitor = SourceMonitor::new();
    let cache = Arc::new(ThumbnailCache::new(config.thumbnail.cache_capacity));
    let provider = Arc::new(WavThumbnail::with_cache(
        config.thumbnail.samples_per_thumbnail_sample,
        cache,
    ));
    let image = ThumbnailImage::new(&monitor, thread, provider, config.thumbnail.clone())?;

    let progress = Arc::new(Progress::default());
    image.add_listener(&progress);

    let info = monitor.load_file(input)?;
    tracing::info!(
        sample_rate = info.sample_rate,
        channels = info.num_channels,
        seconds = info.length_in_seconds(),
        "source loaded"
    );

    let deadline = Instant::now() + timeout;
    let poll_every = config.thumbnail.timer_interval() / 4;
    while !progress.is_finished() {
        if Instant::now() >= deadline {
            return Err(ThumbnailError::msg(format!(
                "thumbnail not finished after {}s",
                timeout.as_secs()
            )));
        }
        image.poll_timer(Instant::now());
        thread::sleep(poll_every.max(Duration::from_millis(1)));
    }

    image.full_image()?.save(output)?;
    tracing::info!(?output, "thumbnail written");
    Ok(())
}

fn run_info(input: &Path) -> waveform_thumbnail_core::Result<()> {
    let info = AudioSource::File(input.to_path_buf()).probe()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Logs render progress and remembers when the image is done.
#[derive(Default)]
struct Progress {
    finished: AtomicBool,
}

impl Progress {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl ThumbnailListener for Progress {
    fn image_updated(&self, image: &ThumbnailImage) {
        if let Ok(seconds) = image.last_time_drawn() {
            tracing::debug!(seconds, "thumbnail updated");
        }
    }

    fn image_finished(&self, _image: &ThumbnailImage) {
        self.finished.store(true, Ordering::Release);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental audio waveform thumbnails", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the waveform of a WAV file into a PNG image.
    Render {
        /// WAV file to draw.
        input: PathBuf,
        /// Destination PNG.
        output: PathBuf,
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Horizontal oversampling factor.
        #[arg(short, long)]
        resolution: Option<f64>,
        /// Source frames folded into each image column.
        #[arg(short, long)]
        samples_per_pixel: Option<usize>,
        /// Give up if rendering takes longer than this.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print sample rate, channel count and length of a WAV file as JSON.
    Info {
        /// WAV file to inspect.
        input: PathBuf,
    },
}
