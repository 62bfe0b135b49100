//! Content-type inference for media handed to the device.

use std::path::Path;

use cast_core::{CastError, CastResult};

/// Content type of everything the transcoder produces.
pub const TRANSCODED_CONTENT_TYPE: &str = "video/mp4";

/// Known content type for `name`'s extension, ignoring case.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let ext = extension(name)?;
    let content_type = match ext.as_str() {
        "mkv" | "mp4" | "m4a" | "m4p" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => return None,
    };
    Some(content_type)
}

/// Pick the content type to announce for a load.
///
/// An explicit type wins, then the extension, then the transcoder's output.
pub fn resolve_content_type(name: &str, supplied: Option<&str>, transcode: bool) -> CastResult<String> {
    if let Some(ct) = supplied.filter(|ct| !ct.is_empty()) {
        return Ok(ct.to_string());
    }
    if let Some(ct) = content_type_for(name) {
        return Ok(ct.to_string());
    }
    if transcode {
        return Ok(TRANSCODED_CONTENT_TYPE.to_string());
    }
    Err(CastError::UnknownContentType(name.to_string()))
}

/// Whether `name` can be played, either natively or through the transcoder.
pub fn playable_media_type(name: &str) -> bool {
    content_type_for(name).is_some() || extension(name).as_deref() == Some("avi")
}

/// `http`/`https` URLs are handed to the device as-is.
pub fn is_remote(source: &str) -> bool {
    match url::Url::parse(source) {
        Ok(u) => matches!(u.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

fn extension(name: &str) -> Option<String> {
    // Strip any query string so remote URLs resolve by their path.
    let path = name.split(['?', '#']).next().unwrap_or(name);
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup_ignores_case() {
        assert_eq!(content_type_for("Movie.MKV"), Some("video/mp4"));
        assert_eq!(content_type_for("/music/track.flac"), Some("audio/flac"));
        assert_eq!(content_type_for("http://host/a.mp3?token=1"), Some("audio/mpeg"));
        assert_eq!(content_type_for("notes.txt"), None);
        assert_eq!(content_type_for("no_extension"), None);
    }

    #[test]
    fn resolution_order() {
        assert_eq!(
            resolve_content_type("a.mp3", Some("audio/ogg"), false).unwrap(),
            "audio/ogg"
        );
        assert_eq!(resolve_content_type("a.webm", None, false).unwrap(), "video/webm");
        assert_eq!(resolve_content_type("a.avi", None, true).unwrap(), "video/mp4");
        assert!(matches!(
            resolve_content_type("a.avi", None, false),
            Err(CastError::UnknownContentType(_))
        ));
    }

    #[test]
    fn avi_is_playable_through_the_transcoder() {
        assert!(playable_media_type("clip.avi"));
        assert!(playable_media_type("clip.mp4"));
        assert!(!playable_media_type("clip.txt"));
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://example.com/a.mp4"));
        assert!(is_remote("http://10.0.0.2:8000/b.mp3"));
        assert!(!is_remote("/home/me/video.mp4"));
        assert!(!is_remote("video.mp4"));
        assert!(!is_remote("file:///tmp/video.mp4"));
    }
}
