//! `castctl load` / `castctl queue`: play and block until the device is done.

use anyhow::{bail, Result};
use cast_client::content::is_remote;
use cast_client::{CastApplication, FinishReason};
use tracing::info;

pub async fn load(app: &CastApplication, source: &str, content_type: Option<&str>, transcode: bool) -> Result<()> {
    check_playable(app, &[source], content_type, transcode)?;
    let reason = interruptible(app.load(source, content_type, transcode)).await?;
    report(reason);
    Ok(())
}

pub async fn queue(
    app: &CastApplication,
    sources: &[String],
    content_type: Option<&str>,
    transcode: bool,
) -> Result<()> {
    let sources: Vec<&str> = sources.iter().map(String::as_str).collect();
    check_playable(app, &sources, content_type, transcode)?;
    let reason = interruptible(app.queue_load(&sources, content_type, transcode)).await?;
    report(reason);
    Ok(())
}

fn check_playable(app: &CastApplication, sources: &[&str], content_type: Option<&str>, transcode: bool) -> Result<()> {
    if content_type.is_some() || transcode {
        return Ok(());
    }
    for source in sources {
        if !is_remote(source) && !app.playable_media_type(source) {
            bail!("{source}: unsupported media type, pass --content-type or --transcode");
        }
    }
    Ok(())
}

/// Ctrl-C abandons the wait; the caller still closes the session.
async fn interruptible<F>(load: F) -> Result<Option<FinishReason>>
where
    F: std::future::Future<Output = cast_client::CastResult<FinishReason>>,
{
    tokio::select! {
        reason = load => Ok(Some(reason?)),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(None)
        }
    }
}

fn report(reason: Option<FinishReason>) {
    match reason {
        Some(FinishReason::Finished) | Some(FinishReason::Interrupted) => println!("playback finished"),
        Some(FinishReason::ApplicationChanged) => println!("another application took over the device"),
        Some(other) => println!("playback ended: {other:?}"),
        None => println!("stopped waiting"),
    }
}
