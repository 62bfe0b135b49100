//! `castctl status`, `info`, `played`.

use anyhow::Result;
use cast_client::CastApplication;

pub fn show(app: &CastApplication) -> Result<()> {
    let status = app.status();

    match &status.application {
        Some(a) if a.is_idle_screen => println!("idle ({})", a.display_name),
        Some(a) => println!("{} [{}] {}", a.display_name, a.app_id, a.status_text),
        None => println!("no application running"),
    }

    if let Some(media) = &status.media {
        let duration = if media.media.duration > 0.0 {
            format!("{:.0}s", media.media.duration)
        } else {
            "live".to_string()
        };
        println!(
            "{:?} {:.0}s / {} {}",
            media.player_state, media.current_time, duration, media.media.content_id
        );
    }

    let level = status.volume.level.map_or("?".to_string(), |l| format!("{:.0}%", l * 100.0));
    let muted = if status.volume.muted.unwrap_or(false) { " (muted)" } else { "" };
    println!("volume {level}{muted}");
    Ok(())
}

pub async fn info(app: &CastApplication) -> Result<()> {
    let info = app.info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

pub fn played(app: &CastApplication) -> Result<()> {
    let mut items: Vec<_> = app.played_items().into_values().collect();
    items.sort_by_key(|i| i.started);
    for item in items {
        let finished = item.finished.map_or("-".to_string(), |f| f.to_string());
        println!("{}\t{}\t{}", item.started, finished, item.content_id);
    }
    Ok(())
}
