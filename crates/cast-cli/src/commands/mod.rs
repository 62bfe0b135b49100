//! CLI subcommand implementations.

pub mod playback;
pub mod status;

use anyhow::{Context, Result};
use cast_client::{CastApplication, CastDevice, ClientConfig};
use tracing::debug;

use crate::{Cli, Command};

/// Connect to the device named on the command line and dispatch.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let addr = cli.addr.context("no device address given, pass --addr")?;
    let device = CastDevice::new(addr, cli.port);

    let app = CastApplication::start(&device, config)
        .await
        .with_context(|| format!("unable to connect to {addr}:{}", cli.port))?;

    let result = dispatch(&app, cli.command).await;
    app.close().await;
    result
}

async fn dispatch(app: &CastApplication, command: Command) -> Result<()> {
    match command {
        Command::Status => status::show(app),
        Command::Info => status::info(app).await,
        Command::Played => status::played(app),
        Command::Load {
            source,
            content_type,
            transcode,
        } => playback::load(app, &source, content_type.as_deref(), transcode).await,
        Command::Queue {
            sources,
            content_type,
            transcode,
        } => playback::queue(app, &sources, content_type.as_deref(), transcode).await,
        Command::Pause => Ok(app.pause().await?),
        Command::Unpause => Ok(app.unpause().await?),
        Command::Toggle => Ok(app.toggle_pause().await?),
        Command::Stop => Ok(app.stop().await?),
        Command::StopMedia => Ok(app.stop_media().await?),
        Command::Next => Ok(app.next().await?),
        Command::Previous => Ok(app.previous().await?),
        Command::Seek { delta } => Ok(app.seek(delta).await?),
        Command::SeekTo { position } => Ok(app.seek_to(position).await?),
        Command::Skip => Ok(app.skip().await?),
        Command::Volume { level } => Ok(app.set_volume(level).await?),
        Command::Mute => Ok(app.set_muted(true).await?),
        Command::Unmute => Ok(app.set_muted(false).await?),
        Command::Launch { app_id } => Ok(app.launch_app(&app_id).await?),
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let path = match &cli.config {
        Some(p) => p.clone(),
        None => match dirs::config_dir() {
            Some(dir) => dir.join("castctl").join("config.toml"),
            None => return Ok(ClientConfig::default()),
        },
    };
    debug!(path = %path.display(), "config path");
    Ok(ClientConfig::load(&path)?)
}
