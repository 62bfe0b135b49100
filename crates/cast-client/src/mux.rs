//! Request/response correlation over one transport.
//!
//! `Multiplexer` stamps request ids, and its dispatch task routes each
//! inbound envelope either to the caller waiting on that id or, when nobody
//! is waiting, to a [`BroadcastHandler`]. The dispatch task is the only
//! owner of the pending-request table; callers talk to it over a command
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use cast_core::messages::{Inbound, Request};
use cast_core::{CastError, CastMessage, CastResult};

use crate::transport::Transport;

type ReplySender = oneshot::Sender<CastResult<CastMessage>>;

/// Receives envelopes nobody was waiting for.
pub trait BroadcastHandler: Send + Sync {
    /// Called on the dispatch task, in arrival order.
    fn on_broadcast(&self, kind: &str, message: &CastMessage);

    /// Called once when the transport stops delivering.
    fn on_closed(&self) {}
}

enum Command {
    Register { request_id: u32, reply: ReplySender },
    Deregister { request_id: u32 },
    PendingCount(oneshot::Sender<usize>),
}

/// Correlates requests with replies over a shared transport.
pub struct Multiplexer {
    transport: Transport,
    /// Next id to hand out. Held across the write so ids hit the wire in order.
    next_id: Mutex<u32>,
    commands: mpsc::UnboundedSender<Command>,
    dispatch_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Take ownership of a transport and its delivery channel and start dispatching.
    pub fn new(
        transport: Transport,
        delivery: mpsc::Receiver<CastMessage>,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let dispatch_handle = tokio::spawn(dispatch_loop(delivery, command_rx, handler));

        Arc::new(Self {
            transport,
            next_id: Mutex::new(1),
            commands,
            dispatch_handle: std::sync::Mutex::new(Some(dispatch_handle)),
        })
    }

    /// Fire-and-forget send. Returns the request id stamped into the payload.
    pub async fn send(
        &self,
        request: &Request,
        source: &str,
        destination: &str,
        namespace: &str,
    ) -> CastResult<u32> {
        let mut next_id = self.next_id.lock().await;
        let request_id = allocate(&mut next_id);
        let message = envelope(request, request_id, source, destination, namespace)?;
        self.transport.send(&message).await?;
        Ok(request_id)
    }

    /// Send and wait up to `timeout` for the reply carrying the same request id.
    ///
    /// The pending entry is removed whether the reply arrives or not.
    pub async fn send_and_wait(
        &self,
        request: &Request,
        source: &str,
        destination: &str,
        namespace: &str,
        timeout: Duration,
    ) -> CastResult<CastMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let request_id = {
            let mut next_id = self.next_id.lock().await;
            let request_id = allocate(&mut next_id);
            let message = envelope(request, request_id, source, destination, namespace)?;

            // Register before writing so a fast reply can't overtake us.
            self.commands
                .send(Command::Register {
                    request_id,
                    reply: reply_tx,
                })
                .map_err(|_| CastError::ConnectionClosed)?;

            if let Err(e) = self.transport.send(&message).await {
                self.deregister(request_id);
                return Err(e);
            }
            request_id
        };

        let result = time::timeout(timeout, reply_rx).await;
        self.deregister(request_id);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CastError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("request {} ({}) timed out", request_id, request.kind());
                Err(CastError::Timeout)
            }
        }
    }

    /// Number of requests still waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close the underlying transport. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    fn deregister(&self, request_id: u32) {
        let _ = self.commands.send(Command::Deregister { request_id });
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let handle = match self.dispatch_handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            h.abort();
        }
    }
}

/// Zero means "unsolicited" on the wire, so it is never handed out.
fn allocate(next_id: &mut u32) -> u32 {
    let id = *next_id;
    *next_id = next_id.checked_add(1).unwrap_or(1);
    id
}

fn envelope(
    request: &Request,
    request_id: u32,
    source: &str,
    destination: &str,
    namespace: &str,
) -> CastResult<CastMessage> {
    let payload = request.to_payload(request_id)?;
    Ok(CastMessage::utf8(source, destination, namespace, payload))
}

/// Resolve an inbound envelope against the pending table.
fn correlate(message: CastMessage, pending: &HashMap<u32, ReplySender>) -> CastResult<Inbound> {
    let header = message.header()?;
    if header.request_id != 0 && pending.contains_key(&header.request_id) {
        return Ok(Inbound::Reply {
            request_id: header.request_id,
            message,
        });
    }
    Ok(Inbound::Broadcast {
        kind: header.kind,
        message,
    })
}

async fn dispatch_loop(
    mut delivery: mpsc::Receiver<CastMessage>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    handler: Arc<dyn BroadcastHandler>,
) {
    let mut pending: HashMap<u32, ReplySender> = HashMap::new();
    let mut connected = true;

    loop {
        tokio::select! {
            biased;

            Some(command) = commands.recv() => match command {
                Command::Register { request_id, reply } => {
                    if connected {
                        pending.insert(request_id, reply);
                    } else {
                        let _ = reply.send(Err(CastError::ConnectionClosed));
                    }
                }
                Command::Deregister { request_id } => {
                    pending.remove(&request_id);
                }
                Command::PendingCount(tx) => {
                    let _ = tx.send(pending.len());
                }
            },

            inbound = delivery.recv(), if connected => match inbound {
                Some(message) => match correlate(message, &pending) {
                    Ok(Inbound::Reply { request_id, message }) => {
                        if let Some(tx) = pending.remove(&request_id) {
                            // The waiter timed out but its Deregister is still queued.
                            if let Err(Ok(message)) = tx.send(Ok(message)) {
                                tracing::debug!("late reply to request {}", request_id);
                                let kind = message.header().map(|h| h.kind).unwrap_or_default();
                                handler.on_broadcast(&kind, &message);
                            }
                        }
                    }
                    Ok(Inbound::Broadcast { kind, message }) => {
                        handler.on_broadcast(&kind, &message);
                    }
                    Err(e) => {
                        tracing::warn!("dropping inbound message: {}", e);
                    }
                },
                None => {
                    connected = false;
                    tracing::debug!("transport closed, failing {} pending requests", pending.len());
                    for (_, tx) in pending.drain() {
                        let _ = tx.send(Err(CastError::ConnectionClosed));
                    }
                    handler.on_closed();
                }
            },

            else => break,
        }
    }

    tracing::debug!("dispatch loop ended");
}

/// A lightweight handle addressing one (source, destination, namespace) triple.
///
/// Several channels share one multiplexer and therefore one connection.
#[derive(Clone)]
pub struct Channel {
    mux: Arc<Multiplexer>,
    source: String,
    destination: String,
    namespace: &'static str,
}

impl Channel {
    pub fn new(
        mux: Arc<Multiplexer>,
        source: impl Into<String>,
        destination: impl Into<String>,
        namespace: &'static str,
    ) -> Self {
        Self {
            mux,
            source: source.into(),
            destination: destination.into(),
            namespace,
        }
    }

    pub async fn send(&self, request: &Request) -> CastResult<u32> {
        self.mux
            .send(request, &self.source, &self.destination, self.namespace)
            .await
    }

    pub async fn send_and_wait(&self, request: &Request, timeout: Duration) -> CastResult<CastMessage> {
        self.mux
            .send_and_wait(request, &self.source, &self.destination, self.namespace, timeout)
            .await
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }
}
