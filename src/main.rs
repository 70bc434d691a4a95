//! Command-line front end: pick a backend, stream cues to stdout, save the
//! finished subtitle file next to the input.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use log::info;
use tokio_util::sync::CancellationToken;

use voxtitle::cancel::with_enforced_cancellation;
use voxtitle::config::Config;
use voxtitle::logger::init_logger;
use voxtitle::transcription::{create_backend, AnalyzeError, BackendKind};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Polling,
    Streaming,
    Recognize,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Polling => BackendKind::Polling,
            BackendArg::Streaming => BackendKind::Streaming,
            BackendArg::Recognize => BackendKind::RecognizeLoop,
        }
    }
}

#[derive(Parser)]
#[command(name = "voxtitle", about = "Transcribe audio into SubRip subtitles")]
struct Args {
    /// WAV file to transcribe.
    file: PathBuf,

    /// Recognition backend.
    #[arg(long, value_enum, default_value = "streaming")]
    backend: BackendArg,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Subtitle output path. Defaults to the input path with `.srt` appended.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("voxtitle: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    init_logger(args.verbose).map_err(|e| format!("logger init failed: {:?}", e))?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let backend = create_backend(args.backend.into(), &config);
    info!("[voxtitle] analyze start ({})", backend.name());

    // Ctrl-C is the run's cancellation signal.
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let cues = backend.analyze(&args.file, cancel.clone());
    let mut cues = with_enforced_cancellation(cues, cancel);

    let mut document = String::new();
    let mut failure = None;
    while let Some(item) = cues.next().await {
        match item {
            Ok(block) => {
                print!("{}", block);
                document.push_str(&block);
            }
            Err(AnalyzeError::Canceled) => {
                info!("[voxtitle] analyze canceled");
                break;
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    // Whatever was produced is still worth keeping, canceled or not.
    if !document.is_empty() {
        let output = args.output.clone().unwrap_or_else(|| {
            let mut path = args.file.clone().into_os_string();
            path.push(".srt");
            PathBuf::from(path)
        });
        std::fs::write(&output, &document).map_err(|e| e.to_string())?;
        info!("[voxtitle] subtitles written to {}", output.display());
    }

    match failure {
        Some(e) => Err(e),
        None => {
            info!("[voxtitle] analyze done");
            Ok(())
        }
    }
}
