//! In-memory receiver double speaking the real framing over a duplex pipe.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use cast_core::codec::{frame_encode, frame_len, message_decode};
use cast_core::messages::NS_CONNECTION;
use cast_core::CastMessage;

use crate::transport::Transport;

pub(crate) struct FakeReceiver {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeReceiver {
    /// A transport wired to a fake device.
    pub(crate) fn pair() -> (Transport, mpsc::Receiver<CastMessage>, FakeReceiver) {
        let (client, device) = tokio::io::duplex(256 * 1024);
        let (transport, delivery) = Transport::from_stream(client);
        let (reader, writer) = tokio::io::split(device);
        (transport, delivery, FakeReceiver { reader, writer })
    }

    /// Next envelope written by the client.
    pub(crate) async fn recv(&mut self) -> CastMessage {
        loop {
            let mut header = [0u8; 4];
            self.reader.read_exact(&mut header).await.expect("read header");
            let len = frame_len(header).expect("frame length");
            if len == 0 {
                continue;
            }
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).await.expect("read body");
            return message_decode(&body).expect("decode envelope");
        }
    }

    /// Next non-connection-namespace envelope; asserts its `type`.
    pub(crate) async fn expect(&mut self, kind: &str) -> CastMessage {
        loop {
            let msg = self.recv().await;
            if msg.namespace == NS_CONNECTION {
                continue;
            }
            let header = msg.header().expect("payload header");
            assert_eq!(header.kind, kind, "unexpected message: {msg}");
            return msg;
        }
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write raw");
    }

    pub(crate) async fn send(&mut self, msg: &CastMessage) {
        let frame = frame_encode(msg).expect("encode frame");
        self.send_raw(&frame).await;
    }

    pub(crate) async fn send_json(&mut self, source: &str, destination: &str, ns: &str, payload: Value) {
        let msg = CastMessage::utf8(source, destination, ns, payload.to_string());
        self.send(&msg).await;
    }

    /// Answer `request`, echoing its request id.
    pub(crate) async fn reply(&mut self, request: &CastMessage, mut payload: Value) {
        let request_id = request.header().expect("request header").request_id;
        payload["requestId"] = json!(request_id);
        let msg = CastMessage::utf8(
            &request.destination_id,
            &request.source_id,
            &request.namespace,
            payload.to_string(),
        );
        self.send(&msg).await;
    }
}

pub(crate) fn receiver_status(app_id: &str, transport_id: &str, idle: bool) -> Value {
    json!({
        "type": "RECEIVER_STATUS",
        "status": {
            "applications": [{
                "appId": app_id,
                "displayName": "Test App",
                "isIdleScreen": idle,
                "sessionId": format!("session-{transport_id}"),
                "statusText": "",
                "transportId": transport_id,
            }],
            "volume": {"level": 0.5, "muted": false}
        }
    })
}

pub(crate) fn media_status(session: i64, current_time: f64, duration: f64) -> Value {
    json!({
        "type": "MEDIA_STATUS",
        "status": [{
            "mediaSessionId": session,
            "playerState": "PLAYING",
            "currentTime": current_time,
            "volume": {"level": 0.25, "muted": false},
            "media": {
                "contentId": "http://example.invalid/clip.mp4",
                "contentType": "video/mp4",
                "duration": duration
            }
        }]
    })
}
