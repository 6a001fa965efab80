// Command-line host: acquires ffmpeg, imports a movie and delivers the converted files.
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use movie_import_lib::{
    acquire_conversion_binary, default_preferences_file, import_movie, inspect_conversion_binary,
    load_preferences, save_preferences, ArchiveSource, AudioExtension, CancellationToken,
    DownloadConsent, ImageExtension, ImportHandoff, LogProgressSink, PipelineConfig,
    PipelineError, PipelineEvent, PipelineResult, ProgressSink, SizeProbePolicy,
};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Converts a movie into an image sequence and an audio track using FFmpeg"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the acquired conversion binary
    #[arg(long, global = true, value_name = "DIR")]
    resource_dir: Option<PathBuf>,

    /// Parent directory for per-run workspaces
    #[arg(long, global = true, value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Preferences file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    prefs_file: Option<PathBuf>,

    /// Extra directories searched for ffmpeg, curl, tar and 7za
    #[arg(long = "search-dir", global = true, value_name = "DIR")]
    search_dirs: Vec<PathBuf>,

    /// Abort downloads when the server does not report the archive size
    #[arg(long, global = true)]
    strict_size: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a movie and hand the image sequence and audio to the output directory
    Import(ImportArgs),
    /// Locate the conversion binary, downloading it when missing
    Acquire(AcquireArgs),
    /// Report where the conversion binary resolves and its version
    Status,
    /// Show or change the stored output formats
    Prefs(PrefsArgs),
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Movie file to import
    #[arg(value_name = "MOVIE")]
    movie: PathBuf,

    /// Copy the converted files here instead of listing them
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Download the conversion binary without asking
    #[arg(short, long)]
    yes: bool,

    /// Image format for this run (jpeg, png, tga)
    #[arg(long, value_parser = parse_image_extension)]
    image_ext: Option<ImageExtension>,

    /// Audio format for this run (mp3, wav)
    #[arg(long, value_parser = parse_audio_extension)]
    audio_ext: Option<AudioExtension>,

    /// Print progress events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,
}

#[derive(Args, Debug)]
struct AcquireArgs {
    /// Download the conversion binary without asking
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct PrefsArgs {
    #[arg(long, value_parser = parse_image_extension)]
    image_ext: Option<ImageExtension>,

    #[arg(long, value_parser = parse_audio_extension)]
    audio_ext: Option<AudioExtension>,
}

fn parse_image_extension(value: &str) -> Result<ImageExtension, String> {
    ImageExtension::parse(value).ok_or_else(|| {
        let allowed: Vec<&str> = ImageExtension::ALL.iter().map(|ext| ext.extension()).collect();
        format!("expected one of {}", allowed.join(", "))
    })
}

fn parse_audio_extension(value: &str) -> Result<AudioExtension, String> {
    AudioExtension::parse(value).ok_or_else(|| {
        let allowed: Vec<&str> = AudioExtension::ALL.iter().map(|ext| ext.extension()).collect();
        format!("expected one of {}", allowed.join(", "))
    })
}

fn build_config(cli: &Cli) -> PipelineResult<PipelineConfig> {
    let mut config = PipelineConfig::for_current_user()?;
    if let Some(resource_dir) = &cli.resource_dir {
        config.resource_dir = resource_dir.clone();
    }
    if let Some(temp_dir) = &cli.temp_dir {
        config.temp_root = temp_dir.clone();
    }
    config.extra_search_dirs = cli.search_dirs.clone();
    if cli.strict_size {
        config.size_probe_policy = SizeProbePolicy::Strict;
    }
    config.resolve_relative_dirs()?;
    Ok(config)
}

fn preferences_path(cli: &Cli) -> PipelineResult<PathBuf> {
    cli.prefs_file
        .clone()
        .or_else(default_preferences_file)
        .ok_or_else(|| {
            PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Failed to resolve preferences location",
            ))
        })
}

fn accept_download(_binary_name: &str, _source: &ArchiveSource) -> bool {
    true
}

fn ask_download_consent(binary_name: &str, source: &ArchiveSource) -> bool {
    print!(
        "{binary_name} was not found. Download it from {}? [y/N] ",
        source.url
    );
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn print_json_event(event: PipelineEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(error) => warn!("Failed to serialize event: {error}"),
    }
}

fn deliver_files(handoff: &ImportHandoff, output_dir: Option<&Path>) -> PipelineResult<()> {
    let Some(output_dir) = output_dir else {
        println!("images: {}", handoff.joined_image_list());
        if let Some(audio) = &handoff.audio {
            println!("audio: {}", audio.display());
        }
        return Ok(());
    };

    fs::create_dir_all(output_dir)?;
    for source in handoff.images.iter().chain(handoff.audio.iter()) {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        fs::copy(source, output_dir.join(file_name))?;
    }
    info!(
        "Copied {} files into {}",
        handoff.images.len() + usize::from(handoff.audio.is_some()),
        output_dir.display()
    );
    Ok(())
}

fn run_import(cli: &Cli, args: &ImportArgs, cancel: &CancellationToken) -> PipelineResult<()> {
    let config = build_config(cli)?;
    let prefs_path = preferences_path(cli)?;
    let mut preferences = load_preferences(&prefs_path)?;
    let mut run_preferences = preferences.clone();
    if let Some(image_ext) = args.image_ext {
        run_preferences.image_extension = image_ext;
    }
    if let Some(audio_ext) = args.audio_ext {
        run_preferences.audio_extension = audio_ext;
    }

    let consent: &dyn DownloadConsent = if args.yes {
        &accept_download
    } else {
        &ask_download_consent
    };
    let sink: &dyn ProgressSink = if args.json_events {
        &print_json_event
    } else {
        &LogProgressSink
    };
    let output_dir = args.output_dir.as_deref();
    let collaborator = |handoff: &ImportHandoff| deliver_files(handoff, output_dir);

    let report = import_movie(
        &config,
        &args.movie,
        &run_preferences,
        consent,
        &collaborator,
        sink,
        cancel,
    )?;

    let movie_path = fs::canonicalize(&args.movie).unwrap_or_else(|_| args.movie.clone());
    preferences.remember_import_directory(&movie_path);
    if let Err(error) = save_preferences(&prefs_path, &preferences) {
        warn!("Failed to store last import directory: {error}");
    }

    info!(
        "Imported {} frames{}",
        report.frames_imported,
        if report.audio_imported { " and audio" } else { "" }
    );
    if let Some(leftover) = &report.leftover_workspace {
        error!("Temporary files left in {}", leftover.display());
    }
    Ok(())
}

fn run_acquire(cli: &Cli, args: &AcquireArgs, cancel: &CancellationToken) -> PipelineResult<()> {
    let config = build_config(cli)?;
    let consent: &dyn DownloadConsent = if args.yes {
        &accept_download
    } else {
        &ask_download_consent
    };
    let binary = acquire_conversion_binary(
        &config,
        consent,
        &LogProgressSink,
        cancel,
    )?;
    if let Some(path) = binary.resolved_path() {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_status(cli: &Cli) -> PipelineResult<()> {
    let config = build_config(cli)?;
    let status = inspect_conversion_binary(&config);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_prefs(cli: &Cli, args: &PrefsArgs) -> PipelineResult<()> {
    let prefs_path = preferences_path(cli)?;
    let mut preferences = load_preferences(&prefs_path)?;
    let mut changed = false;
    if let Some(image_ext) = args.image_ext {
        preferences.image_extension = image_ext;
        changed = true;
    }
    if let Some(audio_ext) = args.audio_ext {
        preferences.audio_extension = audio_ext;
        changed = true;
    }
    if changed {
        save_preferences(&prefs_path, &preferences)?;
        info!("Preferences saved to {}", prefs_path.display());
    }
    println!("{}", serde_json::to_string_pretty(&preferences)?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    let cancel = CancellationToken::new();
    let interrupted = cancel.clone();
    if let Err(error) = ctrlc::set_handler(move || {
        if interrupted.is_cancelled() {
            std::process::exit(130);
        }
        warn!("Interrupt received, cancelling (press Ctrl-C again to exit immediately)");
        interrupted.cancel();
    }) {
        warn!("Failed to install interrupt handler: {error}");
    }

    let result = match &cli.command {
        Commands::Import(args) => run_import(&cli, args, &cancel),
        Commands::Acquire(args) => run_acquire(&cli, args, &cancel),
        Commands::Status => run_status(&cli),
        Commands::Prefs(args) => run_prefs(&cli, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) if error.is_cancelled() => {
            info!("Cancelled");
            ExitCode::FAILURE
        }
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
