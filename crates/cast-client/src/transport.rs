//! TLS transport for the device control channel.
//!
//! Owns the socket: writes length-prefixed envelopes, runs the read loop that
//! deframes inbound envelopes, answers heartbeat PINGs inline and pushes
//! everything else onto a small bounded delivery channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_rustls::TlsConnector;

use cast_core::codec::{frame_encode, frame_len, message_decode};
use cast_core::messages::{kind, Request};
use cast_core::{CastError, CastMessage, CastResult};

/// Capacity of the channel feeding the multiplexer.
pub const DELIVERY_CAPACITY: usize = 5;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed envelope transport over a single stream.
pub struct Transport {
    writer: Arc<Mutex<BoxedWriter>>,
    read_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Set once the read loop has ended or `close` was called.
    closed: Arc<AtomicBool>,
    shut_down: AtomicBool,
}

impl Transport {
    /// Dial the device over TLS.
    ///
    /// Receivers present self-signed certificates, so verification is skipped.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> CastResult<(Self, mpsc::Receiver<CastMessage>)> {
        let connector = TlsConnector::from(Arc::new(tls_config()?));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| CastError::Connect(format!("invalid device address '{host}': {e}")))?;

        let dial = async {
            let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
                CastError::Connect(format!("unable to connect to device at '{host}:{port}': {e}"))
            })?;
            tcp.set_nodelay(true)?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| CastError::Connect(format!("TLS handshake with '{host}:{port}' failed: {e}")))
        };

        let stream = time::timeout(timeout, dial).await.map_err(|_| {
            CastError::Connect(format!("timed out connecting to '{host}:{port}'"))
        })??;

        tracing::info!("TLS connected to {}:{}", host, port);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established stream and start the read loop.
    ///
    /// Returns the transport and the receiving end of the delivery channel.
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::Receiver<CastMessage>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: Arc<Mutex<BoxedWriter>> = Arc::new(Mutex::new(Box::new(writer)));
        let closed = Arc::new(AtomicBool::new(false));
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);

        let read_handle = {
            let writer = writer.clone();
            let closed = closed.clone();
            tokio::spawn(read_loop(reader, writer, delivery_tx, closed))
        };

        let transport = Self {
            writer,
            read_handle: std::sync::Mutex::new(Some(read_handle)),
            closed,
            shut_down: AtomicBool::new(false),
        };
        (transport, delivery_rx)
    }

    /// Frame and write one envelope. Not retried.
    pub async fn send(&self, message: &CastMessage) -> CastResult<()> {
        if self.is_closed() {
            return Err(CastError::ConnectionClosed);
        }
        let frame = frame_encode(message)?;
        tracing::debug!("{}", message);
        write_frame(&self.writer, &frame).await
    }

    /// Stop the read loop and shut the socket down. Idempotent.
    pub async fn close(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.abort_read_loop();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("error shutting down transport: {}", e);
        }
    }

    /// Whether the read loop has ended or `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn abort_read_loop(&self) {
        let handle = match self.read_handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            h.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.abort_read_loop();
    }
}

async fn write_frame(writer: &Mutex<BoxedWriter>, frame: &[u8]) -> CastResult<()> {
    let mut w = writer.lock().await;
    w.write_all(frame)
        .await
        .map_err(|e| CastError::Write(format!("unable to send data: {e}")))?;
    w.flush()
        .await
        .map_err(|e| CastError::Write(format!("unable to flush data: {e}")))
}

/// Read loop: `[len][envelope]` until the stream fails or the task is aborted.
async fn read_loop<R>(
    mut reader: R,
    writer: Arc<Mutex<BoxedWriter>>,
    delivery: mpsc::Sender<CastMessage>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!("transport read ended: {}", e);
            break;
        }

        let len = match frame_len(header) {
            Ok(0) => {
                tracing::trace!("empty frame received");
                continue;
            }
            Ok(len) => len,
            Err(e) => {
                tracing::warn!("dropping connection: {}", e);
                break;
            }
        };

        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            tracing::warn!("short read, wanted {} bytes: {}", len, e);
            break;
        }

        let message = match message_decode(&body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("failed to decode envelope: {}", e);
                continue;
            }
        };
        tracing::debug!("{}", message);

        if is_ping(&message) {
            if let Err(e) = answer_ping(&writer, &message).await {
                tracing::warn!("unable to respond to PING: {}", e);
            }
            continue;
        }

        if delivery.send(message).await.is_err() {
            tracing::debug!("delivery channel closed");
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    tracing::debug!("transport read loop ended");
}

fn is_ping(message: &CastMessage) -> bool {
    message
        .header()
        .map(|h| h.kind == kind::PING)
        .unwrap_or(false)
}

/// PONG travels on the PING's own source, destination and namespace.
async fn answer_ping(writer: &Mutex<BoxedWriter>, ping: &CastMessage) -> CastResult<()> {
    let pong = CastMessage::json(&ping.source_id, &ping.destination_id, &ping.namespace, &Request::Pong)?;
    tracing::trace!("{}", pong);
    write_frame(writer, &frame_encode(&pong)?).await
}

fn tls_config() -> CastResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = AcceptReceiverCertificate {
        schemes: provider.signature_verification_algorithms.supported_schemes(),
    };
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CastError::Connect(format!("TLS config error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts whatever certificate the receiver presents.
///
/// Cast receivers serve a self-signed device certificate with no chain to a
/// public root and no usable hostname, so there is nothing to verify it
/// against. The channel is still encrypted; it is just not authenticated.
#[derive(Debug)]
struct AcceptReceiverCertificate {
    schemes: Vec<rustls::SignatureScheme>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptReceiverCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeReceiver;
    use cast_core::messages::{NS_HEARTBEAT, NS_RECEIVER};
    use cast_core::PayloadHeader;
    use serde_json::json;

    #[tokio::test]
    async fn ping_is_answered_and_not_delivered() {
        let (transport, mut delivery, mut device) = FakeReceiver::pair();

        device
            .send_json("receiver-0", "sender-0", NS_HEARTBEAT, json!({"type": "PING"}))
            .await;
        let pong = device.recv().await;
        assert_eq!(pong.namespace, NS_HEARTBEAT);
        assert_eq!(pong.source_id, "receiver-0");
        assert_eq!(pong.destination_id, "sender-0");
        assert_eq!(pong.header().unwrap().kind, "PONG");

        // Next non-ping message is the first thing delivered.
        device
            .send_json("receiver-0", "sender-0", NS_RECEIVER, json!({"type": "RECEIVER_STATUS"}))
            .await;
        let delivered = delivery.recv().await.unwrap();
        assert_eq!(delivered.header().unwrap().kind, "RECEIVER_STATUS");
        drop(transport);
    }

    #[tokio::test]
    async fn zero_length_frames_are_skipped() {
        let (_transport, mut delivery, mut device) = FakeReceiver::pair();

        device.send_raw(&[0, 0, 0, 0]).await;
        device
            .send_json("receiver-0", "sender-0", NS_RECEIVER, json!({"type": "MEDIA_STATUS"}))
            .await;

        let delivered = delivery.recv().await.unwrap();
        assert_eq!(delivered.header().unwrap().kind, "MEDIA_STATUS");
    }

    #[tokio::test]
    async fn short_read_terminates_the_loop() {
        let (transport, mut delivery, mut device) = FakeReceiver::pair();

        // Promise 100 bytes, deliver 3, then hang up.
        device.send_raw(&[0, 0, 0, 100, 1, 2, 3]).await;
        drop(device);

        assert!(delivery.recv().await.is_none());
        assert!(transport.is_closed());
        let msg = CastMessage::utf8("sender-0", "receiver-0", NS_RECEIVER, "{}");
        assert!(matches!(
            transport.send(&msg).await,
            Err(CastError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn sent_envelopes_reach_the_device() {
        let (transport, _delivery, mut device) = FakeReceiver::pair();

        let payload = Request::GetStatus.to_payload(3).unwrap();
        let msg = CastMessage::utf8("sender-0", "receiver-0", NS_RECEIVER, payload);
        transport.send(&msg).await.unwrap();

        let received = device.recv().await;
        let header: PayloadHeader = received.header().unwrap();
        assert_eq!(header.kind, "GET_STATUS");
        assert_eq!(header.request_id, 3);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (transport, mut delivery, _device) = FakeReceiver::pair();
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        assert!(delivery.recv().await.is_none());
    }

    #[test]
    fn receiver_certificates_use_the_provider_schemes() {
        let provider = rustls::crypto::ring::default_provider();
        let schemes = provider.signature_verification_algorithms.supported_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PSS_SHA256));

        let config = tls_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }
}
