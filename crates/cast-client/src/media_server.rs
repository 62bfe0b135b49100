//! Local HTTP server that lets the device pull media from this host.
//!
//! One route, `/?media_file=<path>&live_streaming=<bool>`. Only files handed
//! to the current session are served. Direct mode supports byte ranges; live
//! mode pipes the transcoder's stdout straight into a chunked response.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use cast_core::{CastError, CastResult};

use crate::content::TRANSCODED_CONTENT_TYPE;
use crate::storage::Storage;

/// Storage key under which played items are persisted.
pub const PLAYED_ITEMS_KEY: &str = "application";

/// Playback bookkeeping for one served file. Timestamps are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayedItem {
    pub content_id: String,
    pub started: u64,
    #[serde(default)]
    pub finished: Option<u64>,
}

#[derive(Default)]
struct LibraryState {
    allowed: HashSet<String>,
    played: HashMap<String, PlayedItem>,
    /// Bumped on every change to `played`.
    generation: u64,
}

/// Writes played-item snapshots, newest wins.
struct PlayedWriter {
    storage: Box<dyn Storage>,
    written: Mutex<u64>,
}

impl PlayedWriter {
    fn write(&self, generation: u64, encoded: &[u8]) {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if generation <= *written {
            return;
        }
        match self.storage.save(PLAYED_ITEMS_KEY, encoded) {
            Ok(()) => *written = generation,
            Err(e) => tracing::warn!("unable to save played items: {}", e),
        }
    }
}

/// Allow-list and played-items record shared by the session and the HTTP handler.
pub struct MediaLibrary {
    state: Mutex<LibraryState>,
    writer: Arc<PlayedWriter>,
}

impl MediaLibrary {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            state: Mutex::new(LibraryState::default()),
            writer: Arc::new(PlayedWriter {
                storage,
                written: Mutex::new(0),
            }),
        }
    }

    /// Seed the played-items map from storage. Failures are logged and ignored.
    pub fn load_played(&self) {
        let bytes = match self.writer.storage.load(PLAYED_ITEMS_KEY) {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("unable to load played items: {}", e);
                return;
            }
        };
        match serde_json::from_slice::<HashMap<String, PlayedItem>>(&bytes) {
            Ok(played) => self.state().played = played,
            Err(e) => tracing::warn!("ignoring unreadable played items: {}", e),
        }
    }

    /// Permit the server to hand out these files.
    pub fn allow<I, S>(&self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.allowed.extend(files.into_iter().map(Into::into));
    }

    pub fn is_allowed(&self, file: &str) -> bool {
        self.state().allowed.contains(file)
    }

    pub fn played_items(&self) -> HashMap<String, PlayedItem> {
        self.state().played.clone()
    }

    fn mark_started(&self, file: &str) {
        let item = PlayedItem {
            content_id: file.to_string(),
            started: unix_now(),
            finished: None,
        };
        self.state().played.insert(file.to_string(), item);
        self.persist();
    }

    fn mark_finished(&self, file: &str) {
        if let Some(item) = self.state().played.get_mut(file) {
            item.finished = Some(unix_now());
        }
        self.persist();
    }

    /// Snapshot the played items and write them off the async runtime.
    fn persist(&self) {
        let (generation, encoded) = {
            let mut state = self.state();
            state.generation += 1;
            (state.generation, serde_json::to_vec(&state.played))
        };
        let encoded = match encoded {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("unable to encode played items: {}", e);
                return;
            }
        };

        let writer = self.writer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || writer.write(generation, &encoded));
            }
            Err(_) => writer.write(generation, &encoded),
        }
    }

    fn state(&self) -> MutexGuard<'_, LibraryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Arguments producing fragmented H.264 MP4 on stdout.
pub fn transcode_args(file: &str) -> Vec<String> {
    [
        "-i",
        file,
        "-vcodec",
        "h264",
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+faststart",
        "-strict",
        "-experimental",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Check the transcoder runs at all before promising the device a stream.
pub async fn probe_transcoder(program: &str) -> CastResult<()> {
    let status = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| CastError::Transcoder(format!("{program} is not available: {e}")))?;
    if !status.success() {
        return Err(CastError::Transcoder(format!("{program} -version exited with {status}")));
    }
    Ok(())
}

#[derive(Clone)]
struct ServerState {
    library: Arc<MediaLibrary>,
    transcoder: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    media_file: String,
    #[serde(default)]
    live_streaming: Option<String>,
}

/// A running media server. Stops when dropped.
pub struct MediaServer {
    port: u16,
    handle: JoinHandle<()>,
}

impl MediaServer {
    /// Bind `0.0.0.0:port` (0 = ephemeral) and start serving.
    pub async fn start(library: Arc<MediaLibrary>, port: u16, transcoder: &str) -> CastResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| CastError::Other(format!("unable to bind media server on port {port}: {e}")))?;
        let port = listener.local_addr()?.port();

        let state = ServerState {
            library,
            transcoder: Arc::from(transcoder),
        };
        let app = Router::new().route("/", get(serve_media)).with_state(state);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("media server stopped: {}", e);
            }
        });

        tracing::info!("media server listening on port {}", port);
        Ok(Self { port, handle })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL the device should fetch `media_file` from.
    pub fn content_url(&self, ip: IpAddr, media_file: &str, live: bool) -> CastResult<String> {
        let base = format!("http://{}/", SocketAddr::new(ip, self.port));
        let mut url = url::Url::parse(&base).map_err(|e| CastError::Other(format!("{base}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("media_file", media_file)
            .append_pair("live_streaming", if live { "true" } else { "false" });
        Ok(url.into())
    }
}

impl Drop for MediaServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_media(
    State(state): State<ServerState>,
    Query(query): Query<MediaQuery>,
    request: Request,
) -> Response {
    let file = query.media_file;
    if !state.library.is_allowed(&file) {
        tracing::warn!("refusing to serve {:?}", file);
        return (StatusCode::BAD_REQUEST, "Invalid file").into_response();
    }

    let live = query.live_streaming.as_deref() == Some("true");
    tracing::info!("serving {:?} (live={})", file, live);
    state.library.mark_started(&file);

    let guard = PlaybackGuard {
        library: state.library.clone(),
        file: file.clone(),
        child: None,
    };

    if live {
        serve_transcoded(&state.transcoder, &file, guard)
    } else {
        serve_file(&file, request, guard).await
    }
}

async fn serve_file(file: &str, request: Request, guard: PlaybackGuard) -> Response {
    let response = match ServeFile::new(file).oneshot(request).await {
        Ok(r) => r,
        Err(never) => match never {},
    };
    let (parts, body) = response.into_parts();
    let stream = Guarded {
        inner: Body::new(body).into_data_stream(),
        _guard: guard,
    };
    Response::from_parts(parts, Body::from_stream(stream))
}

fn serve_transcoded(transcoder: &str, file: &str, mut guard: PlaybackGuard) -> Response {
    let spawned = Command::new(transcoder)
        .args(transcode_args(file))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("unable to start {}: {}", transcoder, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "transcoder unavailable").into_response();
        }
    };

    if let Some(stderr) = child.stderr.take() {
        let name = transcoder.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("{}: {}", name, line);
            }
        });
    }

    let Some(stdout) = child.stdout.take() else {
        tracing::error!("{} stdout was not captured", transcoder);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    guard.child = Some(child);

    let stream = Guarded {
        inner: ReaderStream::new(stdout),
        _guard: guard,
    };

    axum::http::Response::builder()
        .header(header::CONTENT_TYPE, TRANSCODED_CONTENT_TYPE)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            tracing::error!("building live response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Records the finish time, and reaps the transcoder, once the body is dropped.
struct PlaybackGuard {
    library: Arc<MediaLibrary>,
    file: String,
    child: Option<Child>,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    tracing::warn!("transcoder for {:?} exited with {}", self.file, status);
                }
                Ok(Some(_)) => {}
                // Still running: the device hung up early. kill_on_drop reaps it.
                Ok(None) => tracing::debug!("stopping transcoder for {:?}", self.file),
                Err(e) => tracing::warn!("transcoder for {:?}: {}", self.file, e),
            }
        }
        self.library.mark_finished(&self.file);
        tracing::debug!("finished serving {:?}", self.file);
    }
}

/// Body stream that keeps a [`PlaybackGuard`] alive until the response is done.
struct Guarded<S> {
    inner: S,
    _guard: PlaybackGuard,
}

impl<S: Stream + Unpin> Stream for Guarded<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    async fn started(dir: &tempfile::TempDir, transcoder: &str) -> (Arc<MediaLibrary>, MediaServer, String) {
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"0123456789abcdef").unwrap();
        let file = path.to_string_lossy().into_owned();

        let library = Arc::new(MediaLibrary::new(Box::new(MemoryStorage::default())));
        let server = MediaServer::start(library.clone(), 0, transcoder).await.unwrap();
        (library, server, file)
    }

    fn local_url(server: &MediaServer, file: &str, live: bool) -> String {
        server
            .content_url("127.0.0.1".parse().unwrap(), file, live)
            .unwrap()
    }

    async fn wait_finished(library: &MediaLibrary, file: &str) -> PlayedItem {
        for _ in 0..100 {
            if let Some(item) = library.played_items().get(file) {
                if item.finished.is_some() {
                    return item.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{file} never finished");
    }

    #[tokio::test]
    async fn unlisted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (library, server, file) = started(&dir, "ffmpeg").await;

        let response = reqwest::get(local_url(&server, &file, false)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(response.text().await.unwrap(), "Invalid file");
        assert!(library.played_items().is_empty());
    }

    #[tokio::test]
    async fn allowed_file_is_served_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (library, server, file) = started(&dir, "ffmpeg").await;
        library.allow([file.clone()]);

        let response = reqwest::get(local_url(&server, &file, false)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(&response.bytes().await.unwrap()[..], b"0123456789abcdef");

        let item = wait_finished(&library, &file).await;
        assert_eq!(item.content_id, file);
        assert!(item.finished.unwrap() >= item.started);
    }

    #[tokio::test]
    async fn byte_ranges_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let (library, server, file) = started(&dir, "ffmpeg").await;
        library.allow([file.clone()]);

        let response = reqwest::Client::new()
            .get(local_url(&server, &file, false))
            .header("Range", "bytes=4-7")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
        assert_eq!(&response.bytes().await.unwrap()[..], b"4567");
    }

    #[tokio::test]
    async fn played_items_are_persisted_and_reloaded() {
        let storage = MemoryStorage::default();
        let mut played = HashMap::new();
        played.insert(
            "/m/a.mp4".to_string(),
            PlayedItem {
                content_id: "/m/a.mp4".into(),
                started: 10,
                finished: Some(20),
            },
        );
        storage
            .save(PLAYED_ITEMS_KEY, &serde_json::to_vec(&played).unwrap())
            .unwrap();

        let library = MediaLibrary::new(Box::new(storage));
        library.load_played();
        assert_eq!(library.played_items(), played);
    }

    /// Storage the test can still read after handing it to a library.
    struct SharedStorage(Arc<MemoryStorage>);

    impl Storage for SharedStorage {
        fn load(&self, key: &str) -> CastResult<Option<Vec<u8>>> {
            self.0.load(key)
        }

        fn save(&self, key: &str, value: &[u8]) -> CastResult<()> {
            self.0.save(key, value)
        }
    }

    #[tokio::test]
    async fn serving_writes_the_played_items_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"payload").unwrap();
        let file = path.to_string_lossy().into_owned();

        let storage = Arc::new(MemoryStorage::default());
        let library = Arc::new(MediaLibrary::new(Box::new(SharedStorage(storage.clone()))));
        library.allow([file.clone()]);
        let server = MediaServer::start(library.clone(), 0, "ffmpeg").await.unwrap();

        reqwest::get(local_url(&server, &file, false))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        wait_finished(&library, &file).await;

        // Writes land on the blocking pool; wait for the finished snapshot.
        for _ in 0..100 {
            if let Some(bytes) = storage.load(PLAYED_ITEMS_KEY).unwrap() {
                let saved: HashMap<String, PlayedItem> = serde_json::from_slice(&bytes).unwrap();
                if saved.get(&file).is_some_and(|item| item.finished.is_some()) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("finished entry for {file} was never saved");
    }

    #[test]
    fn stale_snapshots_never_overwrite_newer_ones() {
        let storage = Arc::new(MemoryStorage::default());
        let writer = PlayedWriter {
            storage: Box::new(SharedStorage(storage.clone())),
            written: Mutex::new(0),
        };

        writer.write(2, b"newer");
        writer.write(1, b"older");
        assert_eq!(storage.load(PLAYED_ITEMS_KEY).unwrap().unwrap(), b"newer");
    }

    #[tokio::test]
    async fn content_url_escapes_the_path() {
        let library = Arc::new(MediaLibrary::new(Box::new(MemoryStorage::default())));
        let server = MediaServer::start(library, 0, "ffmpeg").await.unwrap();
        let url = server
            .content_url("192.168.1.10".parse().unwrap(), "/media/my film.mkv", true)
            .unwrap();
        assert_eq!(
            url,
            format!(
                "http://192.168.1.10:{}/?media_file=%2Fmedia%2Fmy+film.mkv&live_streaming=true",
                server.port()
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_mode_streams_transcoder_stdout() {
        let dir = tempfile::tempdir().unwrap();
        // `echo` prints its arguments, standing in for the transcoder.
        let (library, server, file) = started(&dir, "echo").await;
        library.allow([file.clone()]);

        let response = reqwest::get(local_url(&server, &file, true)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            TRANSCODED_CONTENT_TYPE
        );
        let body = response.text().await.unwrap();
        assert_eq!(body.trim_end(), transcode_args(&file).join(" "));

        wait_finished(&library, &file).await;
    }

    #[tokio::test]
    async fn probe_reports_missing_transcoder() {
        let err = probe_transcoder("definitely-not-a-real-transcoder").await.unwrap_err();
        assert!(matches!(err, CastError::Transcoder(_)));
    }
}
