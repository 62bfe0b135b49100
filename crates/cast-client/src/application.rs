//! Device session: receiver/media state tracking and user-facing commands.
//!
//! `CastApplication` rides on one [`Multiplexer`]. Commands go out through
//! lightweight [`Channel`] handles (default connection, receiver, and the
//! running app's connection/media namespaces), while unsolicited status
//! pushes land in [`Shared`], which keeps the cached snapshots current and
//! resolves the finish signal a blocking `load` waits on.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::time;

use cast_core::messages::{
    kind, IdleReason, LoadCommand, MediaCommand, MediaItem, MediaStatus, MediaStatusResponse,
    PlayerState, QueueItem, QueueLoadCommand, QueueUpdateCommand, ReceiverApplication,
    ReceiverStatusResponse, RepeatMode, ResumeState, SeekCommand, Volume,
};
use cast_core::{
    CastError, CastMessage, CastResult, Request, DEFAULT_MEDIA_RECEIVER_APP_ID, DEFAULT_RECEIVER,
    DEFAULT_SENDER, NS_CONNECTION, NS_MEDIA, NS_RECEIVER,
};

use crate::config::ClientConfig;
use crate::content::{is_remote, playable_media_type, resolve_content_type};
use crate::device::{fetch_device_info, CastDevice, DeviceInfo};
use crate::media_server::{probe_transcoder, MediaLibrary, MediaServer, PlayedItem};
use crate::mux::{BroadcastHandler, Channel, Multiplexer};
use crate::net::detect_local_ip;
use crate::storage;
use crate::transport::Transport;

const STREAM_BUFFERED: &str = "BUFFERED";

/// Seconds before the end that `skip` jumps to.
const SKIP_LEAD_SECS: f64 = 10.0;

/// Why a blocking load returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Playback reached the end with nothing queued behind it.
    Finished,
    /// The receiver interrupted playback with an empty item (end of a queue).
    Interrupted,
    LoadFailed,
    /// Another controller replaced the running application.
    ApplicationChanged,
    ConnectionClosed,
}

/// Snapshot of the cached device state.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub application: Option<ReceiverApplication>,
    pub media: Option<MediaStatus>,
    pub volume: Volume,
}

#[derive(Default)]
struct SessionState {
    app: Option<ReceiverApplication>,
    media: Option<MediaStatus>,
    volume: Volume,
}

/// Single-slot completion signal. Each arm hands out one receiver, and at
/// most one reason is ever delivered to it.
#[derive(Default)]
struct FinishSignal {
    slot: Mutex<Option<oneshot::Sender<FinishReason>>>,
}

impl FinishSignal {
    fn arm(&self) -> oneshot::Receiver<FinishReason> {
        let (tx, rx) = oneshot::channel();
        *self.lock() = Some(tx);
        rx
    }

    /// Returns false when nothing was armed or the signal already fired.
    fn fire(&self, reason: FinishReason) -> bool {
        match self.lock().take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    fn disarm(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<FinishReason>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State touched by both command methods and the dispatch task.
#[derive(Default)]
struct Shared {
    state: Mutex<SessionState>,
    finish: FinishSignal,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, reason: FinishReason) {
        if self.finish.fire(reason) {
            tracing::info!("playback ended: {:?}", reason);
        }
    }

    fn on_media_status(&self, message: &CastMessage) {
        let response: MediaStatusResponse = match message.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("unreadable MEDIA_STATUS: {}", e);
                return;
            }
        };

        if let Some(first) = response.status.first() {
            let mut state = self.state();
            state.volume = first.volume.clone();
            state.media = Some(first.clone());
        }

        for status in &response.status {
            match status.idle_reason {
                Some(IdleReason::Finished) if status.loading_item_id == 0 => {
                    self.resolve(FinishReason::Finished);
                }
                Some(IdleReason::Interrupted) if status.media.content_id.is_empty() => {
                    self.resolve(FinishReason::Interrupted);
                }
                _ => {}
            }
        }
    }

    fn on_receiver_status(&self, message: &CastMessage) {
        let response: ReceiverStatusResponse = match message.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("unreadable RECEIVER_STATUS: {}", e);
                return;
            }
        };
        let reported = response.status.applications.last().cloned();

        let changed = {
            let mut state = self.state();
            state.volume = response.status.volume;
            let Some(current) = state.app.as_ref() else {
                return;
            };
            let changed = reported.as_ref().map(|a| a.app_id.as_str()) != Some(current.app_id.as_str());
            if changed {
                tracing::info!(
                    "receiver application changed from {} to {}",
                    current.app_id,
                    reported.as_ref().map_or("nothing", |a| a.app_id.as_str())
                );
                state.app = reported;
                state.media = None;
            }
            changed
        };

        if changed {
            self.resolve(FinishReason::ApplicationChanged);
        }
    }
}

impl BroadcastHandler for Shared {
    fn on_broadcast(&self, kind: &str, message: &CastMessage) {
        match kind {
            kind::LOAD_FAILED => {
                tracing::warn!("device failed to load media: {}", message.payload());
                self.resolve(FinishReason::LoadFailed);
            }
            kind::MEDIA_STATUS => self.on_media_status(message),
            kind::RECEIVER_STATUS => self.on_receiver_status(message),
            kind::CLOSE => tracing::debug!("device closed virtual connection from {}", message.source_id),
            _ => tracing::debug!("ignoring broadcast {}", message),
        }
    }

    fn on_closed(&self) {
        self.resolve(FinishReason::ConnectionClosed);
    }
}

/// A control session with one receiver.
pub struct CastApplication {
    mux: Arc<Multiplexer>,
    connection: Channel,
    receiver: Channel,
    shared: Arc<Shared>,
    library: Arc<MediaLibrary>,
    media_server: tokio::sync::Mutex<Option<MediaServer>>,
    device_addr: IpAddr,
    config: ClientConfig,
}

impl CastApplication {
    /// Connect to `device`, open the default virtual connection and fetch status.
    pub async fn start(device: &CastDevice, config: ClientConfig) -> CastResult<Self> {
        let host = device.address.to_string();
        let (transport, delivery) = Transport::connect(&host, device.port, config.connect_timeout()).await?;
        let app = Self::from_transport(transport, delivery, device.address, config);

        app.connection.send(&Request::Connect).await?;
        app.update().await?;
        Ok(app)
    }

    /// Build a session over an already-connected transport.
    pub fn from_transport(
        transport: Transport,
        delivery: mpsc::Receiver<CastMessage>,
        device_addr: IpAddr,
        config: ClientConfig,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let mux = Multiplexer::new(transport, delivery, shared.clone());

        let library = Arc::new(MediaLibrary::new(storage::open(&config)));
        library.load_played();

        Self {
            connection: Channel::new(mux.clone(), DEFAULT_SENDER, DEFAULT_RECEIVER, NS_CONNECTION),
            receiver: Channel::new(mux.clone(), DEFAULT_SENDER, DEFAULT_RECEIVER, NS_RECEIVER),
            mux,
            shared,
            library,
            media_server: tokio::sync::Mutex::new(None),
            device_addr,
            config,
        }
    }

    /// Refresh receiver state, and media state when a non-idle app is running.
    ///
    /// GET_STATUS is retried because the receiver may not answer straight
    /// after discovery.
    pub async fn update(&self) -> CastResult<()> {
        let attempts = self.config.status_attempts.max(1);
        let mut response = None;

        for attempt in 1..=attempts {
            match self.receiver_status().await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(CastError::ConnectionClosed) => return Err(CastError::ConnectionClosed),
                Err(e) => {
                    tracing::debug!("receiver status attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        time::sleep(self.config.status_retry_interval()).await;
                    }
                }
            }
        }
        let response = response.ok_or(CastError::StatusUnavailable { attempts })?;

        let apps = response.status.applications;
        if apps.len() > 1 {
            tracing::debug!("receiver reports {} applications, tracking the last", apps.len());
        }
        let app = apps.into_iter().last();

        let media_app = {
            let mut state = self.shared.state();
            state.volume = response.status.volume;
            state.app = app.clone();
            match app {
                Some(a) if !a.is_idle_screen => Some(a),
                _ => {
                    state.media = None;
                    None
                }
            }
        };

        if let Some(app) = media_app {
            self.app_channel(&app, NS_CONNECTION).send(&Request::Connect).await?;
            if let Err(e) = self.update_media_status().await {
                tracing::warn!("unable to fetch media status: {}", e);
            }
        }
        Ok(())
    }

    async fn receiver_status(&self) -> CastResult<ReceiverStatusResponse> {
        let reply = self
            .receiver
            .send_and_wait(&Request::GetStatus, self.config.request_timeout())
            .await?;
        let header = reply.header()?;
        if header.kind != kind::RECEIVER_STATUS {
            return Err(CastError::InvalidMessage(format!(
                "expected RECEIVER_STATUS, got {}",
                header.kind
            )));
        }
        reply.decode_payload()
    }

    /// Refresh the cached media status from the running app.
    pub async fn update_media_status(&self) -> CastResult<Option<MediaStatus>> {
        let media = self.media_channel()?;
        let reply = media
            .send_and_wait(&Request::GetStatus, self.config.request_timeout())
            .await?;
        let response: MediaStatusResponse = reply.decode_payload()?;
        Ok(self.apply_media_status(response))
    }

    /// Replace the cached media with the first reported session.
    fn apply_media_status(&self, response: MediaStatusResponse) -> Option<MediaStatus> {
        let current = response.status.into_iter().next();
        let mut state = self.shared.state();
        if let Some(m) = current.as_ref() {
            state.volume = m.volume.clone();
        }
        state.media = current.clone();
        current
    }

    /// Play one item and wait until the device reports it done.
    ///
    /// Local paths are served from the built-in media server; `http(s)` URLs
    /// are handed to the device directly.
    pub async fn load(&self, source: &str, content_type: Option<&str>, transcode: bool) -> CastResult<FinishReason> {
        let media = self
            .prepare_media(&[source], content_type, transcode)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CastError::Other("nothing to load".into()))?;

        self.ensure_media_receiver().await?;
        self.play_until_finished(Request::Load(LoadCommand {
            media,
            current_time: 0.0,
            autoplay: true,
        }))
        .await
    }

    /// Play a list of items as a receiver-side queue and wait for the end.
    pub async fn queue_load(
        &self,
        sources: &[&str],
        content_type: Option<&str>,
        transcode: bool,
    ) -> CastResult<FinishReason> {
        let items: Vec<QueueItem> = self
            .prepare_media(sources, content_type, transcode)
            .await?
            .into_iter()
            .map(|media| QueueItem { media, autoplay: true })
            .collect();
        if items.is_empty() {
            return Err(CastError::Other("nothing to load".into()));
        }

        self.ensure_media_receiver().await?;
        self.play_until_finished(Request::QueueLoad(QueueLoadCommand {
            items,
            start_index: 0,
            repeat_mode: RepeatMode::RepeatOff,
            current_time: 0.0,
        }))
        .await
    }

    async fn play_until_finished(&self, request: Request) -> CastResult<FinishReason> {
        let media = self.media_channel()?;
        let finished = self.shared.finish.arm();
        if let Err(e) = media.send(&request).await {
            self.shared.finish.disarm();
            return Err(e);
        }
        tracing::info!("{} sent, waiting for playback to end", request.kind());

        let outcome = match finished.await {
            Ok(FinishReason::LoadFailed) => Err(CastError::LoadFailed),
            Ok(FinishReason::ConnectionClosed) => Err(CastError::ConnectionClosed),
            Ok(reason) => Ok(reason),
            Err(_) => Err(CastError::Other("superseded by a newer load".into())),
        };
        self.shared.state().media = None;
        outcome
    }

    async fn prepare_media(
        &self,
        sources: &[&str],
        content_type: Option<&str>,
        transcode: bool,
    ) -> CastResult<Vec<MediaItem>> {
        let mut items = Vec::with_capacity(sources.len());
        let mut local = Vec::new();

        for source in sources {
            if is_remote(source) {
                if transcode {
                    tracing::warn!("remote media is never transcoded: {}", source);
                }
                items.push(Some(MediaItem {
                    content_id: source.to_string(),
                    content_type: resolve_content_type(source, content_type, transcode)?,
                    stream_type: STREAM_BUFFERED.to_string(),
                    ..MediaItem::default()
                }));
                continue;
            }

            let path = tokio::fs::canonicalize(source)
                .await
                .map_err(|e| CastError::Other(format!("unable to find {source:?}: {e}")))?;
            let path = path.to_string_lossy().into_owned();
            let ct = if transcode {
                resolve_content_type("", content_type, true)?
            } else {
                resolve_content_type(&path, content_type, false)?
            };
            local.push((items.len(), path, ct));
            items.push(None);
        }

        if !local.is_empty() {
            if transcode {
                probe_transcoder(&self.config.transcoder).await?;
            }
            self.library.allow(local.iter().map(|(_, path, _)| path.clone()));

            let paths: Vec<&str> = local.iter().map(|(_, path, _)| path.as_str()).collect();
            let urls = self.content_urls(&paths, transcode).await?;
            for ((index, _, ct), url) in local.into_iter().zip(urls) {
                items[index] = Some(MediaItem {
                    content_id: url,
                    content_type: ct,
                    stream_type: STREAM_BUFFERED.to_string(),
                    ..MediaItem::default()
                });
            }
        }

        Ok(items.into_iter().flatten().collect())
    }

    /// Start the media server on first use and build URLs pointing at it.
    async fn content_urls(&self, files: &[&str], live: bool) -> CastResult<Vec<String>> {
        let ip = detect_local_ip(self.config.local_ip, self.device_addr)?;

        let mut slot = self.media_server.lock().await;
        let server = match slot.take() {
            Some(server) => server,
            None => {
                MediaServer::start(
                    self.library.clone(),
                    self.config.media_server_port,
                    &self.config.transcoder,
                )
                .await?
            }
        };
        let urls = files
            .iter()
            .map(|f| server.content_url(ip, f, live))
            .collect::<CastResult<Vec<_>>>();
        *slot = Some(server);
        urls
    }

    /// Port of the media server, once one has been started.
    pub async fn media_server_port(&self) -> Option<u16> {
        self.media_server.lock().await.as_ref().map(MediaServer::port)
    }

    async fn ensure_media_receiver(&self) -> CastResult<()> {
        let running = self
            .shared
            .state()
            .app
            .as_ref()
            .is_some_and(|a| a.app_id == DEFAULT_MEDIA_RECEIVER_APP_ID);
        if !running {
            self.launch_app(DEFAULT_MEDIA_RECEIVER_APP_ID).await?;
        }
        Ok(())
    }

    /// Launch `app_id` on the receiver and refresh state.
    pub async fn launch_app(&self, app_id: &str) -> CastResult<()> {
        tracing::info!("launching {}", app_id);
        let reply = self
            .receiver
            .send_and_wait(
                &Request::Launch {
                    app_id: app_id.to_string(),
                },
                self.config.request_timeout(),
            )
            .await?;
        let header = reply.header()?;
        if header.kind != kind::RECEIVER_STATUS {
            return Err(CastError::Other(format!(
                "unable to launch {app_id}: {}",
                reply.payload()
            )));
        }

        self.update().await?;
        let launched = self.shared.state().app.as_ref().map(|a| a.app_id.clone());
        if launched.as_deref() != Some(app_id) {
            tracing::warn!("asked for {} but receiver reports {:?}", app_id, launched);
        }
        Ok(())
    }

    pub async fn pause(&self) -> CastResult<()> {
        let media = self.current_media("pause")?;
        self.send_media(&Request::Pause(MediaCommand {
            media_session_id: media.media_session_id,
        }))
        .await
    }

    pub async fn unpause(&self) -> CastResult<()> {
        let media = self.current_media("unpause")?;
        self.send_media(&Request::Play(MediaCommand {
            media_session_id: media.media_session_id,
        }))
        .await
    }

    /// Pause when playing, play otherwise.
    pub async fn toggle_pause(&self) -> CastResult<()> {
        let media = self.current_media("toggle")?;
        if media.player_state == PlayerState::Playing {
            self.pause().await
        } else {
            self.unpause().await
        }
    }

    /// End the media session; the receiver app keeps running.
    pub async fn stop_media(&self) -> CastResult<()> {
        let media = self.current_media("stop")?;
        self.send_media(&Request::StopMedia(MediaCommand {
            media_session_id: media.media_session_id,
        }))
        .await
    }

    /// Stop the running receiver application.
    pub async fn stop(&self) -> CastResult<()> {
        self.current_media("stop")?;
        let session_id = self
            .shared
            .state()
            .app
            .as_ref()
            .map(|a| a.session_id.clone())
            .filter(|s| !s.is_empty());
        self.receiver.send(&Request::StopApp { session_id }).await?;
        Ok(())
    }

    pub async fn next(&self) -> CastResult<()> {
        self.queue_jump("skip forward", 1).await
    }

    pub async fn previous(&self) -> CastResult<()> {
        self.queue_jump("skip back", -1).await
    }

    async fn queue_jump(&self, action: &'static str, jump: i32) -> CastResult<()> {
        let media = self.current_media(action)?;
        let reply = self
            .media_channel()?
            .send_and_wait(
                &Request::QueueUpdate(QueueUpdateCommand {
                    media_session_id: media.media_session_id,
                    jump,
                }),
                self.config.request_timeout(),
            )
            .await?;
        match reply.decode_payload::<MediaStatusResponse>() {
            Ok(response) if !response.status.is_empty() => {
                self.apply_media_status(response);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("unreadable reply to QUEUE_UPDATE: {}", e),
        }
        Ok(())
    }

    /// Seek `delta` seconds relative to the current position.
    pub async fn seek(&self, delta: f64) -> CastResult<()> {
        let media = self.fresh_media("seek").await?;
        self.send_seek(&media, seek_target(&media, delta)).await
    }

    /// Seek to an absolute position in seconds.
    pub async fn seek_to(&self, position: f64) -> CastResult<()> {
        let media = self.fresh_media("seek").await?;
        self.send_seek(&media, position.max(0.0)).await
    }

    /// Jump to just before the end of the current item.
    pub async fn skip(&self) -> CastResult<()> {
        let media = self.fresh_media("skip").await?;
        self.send_seek(&media, skip_target(&media)).await
    }

    async fn send_seek(&self, media: &MediaStatus, position: f64) -> CastResult<()> {
        tracing::debug!("seeking media session {} to {:.1}s", media.media_session_id, position);
        self.send_media(&Request::Seek(SeekCommand {
            media_session_id: media.media_session_id,
            current_time: position,
            resume_state: ResumeState::PlaybackStart,
        }))
        .await
    }

    pub async fn set_volume(&self, level: f32) -> CastResult<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(CastError::VolumeOutOfRange(level));
        }
        self.send_volume(Volume {
            level: Some(level),
            muted: None,
        })
        .await
    }

    pub async fn set_muted(&self, muted: bool) -> CastResult<()> {
        self.send_volume(Volume {
            level: None,
            muted: Some(muted),
        })
        .await
    }

    async fn send_volume(&self, volume: Volume) -> CastResult<()> {
        let reply = self
            .receiver
            .send_and_wait(&Request::SetVolume { volume }, self.config.request_timeout())
            .await?;
        if let Ok(response) = reply.decode_payload::<ReceiverStatusResponse>() {
            self.shared.state().volume = response.status.volume;
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        let state = self.shared.state();
        Status {
            application: state.app.clone(),
            media: state.media.clone(),
            volume: state.volume.clone(),
        }
    }

    pub fn played_items(&self) -> HashMap<String, PlayedItem> {
        self.library.played_items()
    }

    pub fn playable_media_type(&self, filename: &str) -> bool {
        playable_media_type(filename)
    }

    /// Setup information from the device's HTTP endpoint.
    pub async fn info(&self) -> CastResult<DeviceInfo> {
        fetch_device_info(self.device_addr, self.config.request_timeout()).await
    }

    /// Best-effort CLOSE on the app and default connections, then hang up.
    pub async fn close(&self) {
        let app = self.shared.state().app.clone();
        if let Some(app) = app {
            if let Err(e) = self.app_channel(&app, NS_CONNECTION).send(&Request::Close).await {
                tracing::debug!("closing app connection: {}", e);
            }
        }
        if let Err(e) = self.connection.send(&Request::Close).await {
            tracing::debug!("closing default connection: {}", e);
        }
        self.mux.close().await;
    }

    fn current_media(&self, action: &'static str) -> CastResult<MediaStatus> {
        self.shared
            .state()
            .media
            .clone()
            .ok_or(CastError::MediaNotInitialized(action))
    }

    /// Current media, refreshed from the device when possible.
    async fn fresh_media(&self, action: &'static str) -> CastResult<MediaStatus> {
        self.current_media(action)?;
        if let Err(e) = self.update_media_status().await {
            tracing::debug!("using cached media status: {}", e);
        }
        self.current_media(action)
    }

    async fn send_media(&self, request: &Request) -> CastResult<()> {
        self.media_channel()?.send(request).await?;
        Ok(())
    }

    fn media_channel(&self) -> CastResult<Channel> {
        let app = self.shared.state().app.clone().ok_or(CastError::ApplicationNotSet)?;
        Ok(self.app_channel(&app, NS_MEDIA))
    }

    fn app_channel(&self, app: &ReceiverApplication, namespace: &'static str) -> Channel {
        Channel::new(self.mux.clone(), DEFAULT_SENDER, app.transport_id.clone(), namespace)
    }
}

/// Relative seek target, kept inside the item when its duration is known.
fn seek_target(media: &MediaStatus, delta: f64) -> f64 {
    let target = media.current_time + delta;
    let duration = media.media.duration;
    if duration > 0.0 {
        target.clamp(0.0, duration)
    } else {
        target.max(0.0)
    }
}

/// Live items have no duration, so fall back to the current position.
fn skip_target(media: &MediaStatus) -> f64 {
    let duration = media.media.duration;
    let target = if duration > 0.0 {
        duration - SKIP_LEAD_SECS
    } else {
        media.current_time - SKIP_LEAD_SECS
    };
    target.max(0.0)
}
