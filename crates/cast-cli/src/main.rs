//! castctl: control a cast receiver from the command line.
//!
//! Plays local files (served from this host) or remote URLs, and drives the
//! running media session: pause, seek, queue navigation, volume.

mod commands;

use std::net::IpAddr;
use std::path::PathBuf;

use cast_client::device::CONTROL_PORT;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// castctl: cast receiver controller
#[derive(Parser)]
#[command(name = "castctl", version = "0.1.0", about = "Control cast receivers: play media, pause, seek, volume")]
struct Cli {
    /// Device address
    #[arg(short, long, global = true)]
    addr: Option<IpAddr>,

    /// Device control port
    #[arg(short, long, global = true, default_value_t = CONTROL_PORT)]
    port: u16,

    /// Config file path (defaults to the user config dir)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level for castctl and the client library (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the running application, media and volume
    Status,

    /// Play a file or URL and wait until it finishes
    Load {
        /// Local path or http(s) URL
        source: String,
        /// Override the inferred content type
        #[arg(long)]
        content_type: Option<String>,
        /// Transcode through the configured transcoder
        #[arg(long)]
        transcode: bool,
    },

    /// Play several files or URLs as a queue
    Queue {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        transcode: bool,
    },

    /// Pause playback
    Pause,

    /// Resume playback
    Unpause,

    /// Pause when playing, resume otherwise
    Toggle,

    /// Stop the running receiver application
    Stop,

    /// Stop the media session, leaving the application running
    StopMedia,

    /// Next queue item
    Next,

    /// Previous queue item
    Previous,

    /// Seek relative to the current position, in seconds
    Seek {
        #[arg(allow_negative_numbers = true)]
        delta: f64,
    },

    /// Seek to an absolute position, in seconds
    SeekTo { position: f64 },

    /// Jump to just before the end of the current item
    Skip,

    /// Set the device volume (0.0 - 1.0)
    Volume { level: f32 },

    /// Mute the device
    Mute,

    /// Unmute the device
    Unmute,

    /// Launch a receiver application by id
    Launch { app_id: String },

    /// Show device setup information
    Info,

    /// List locally recorded played items
    Played,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise --log-level, then -v.
    let level = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.as_str(),
        (None, true) => "debug",
        (None, false) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "castctl={level},cast_cli={level},cast_client={level},cast_core={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .init();

    let result = commands::run(cli).await;

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("castctl: {e:#}");
        std::process::exit(1);
    }
}
