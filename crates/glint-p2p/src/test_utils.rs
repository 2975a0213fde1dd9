//! In-memory collaborators: a transport whose peers run scripted responders,
//! a discovery feed and a broadcast layer that only records subscriptions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use futures::stream::{self, BoxStream, IntoAsyncRead, StreamExt, TryStreamExt};
use glint_core::types::spec::{ChainSpec, ForkName};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Duration;

use crate::discovery::{DiscoveredRecord, Discovery};
use crate::gossip::Broadcast;
use crate::rpc::codec::{encode_error_response, encode_response_item, read_request};
use crate::rpc::{JsonPayloadCodec, Protocol, Request, ResponseCode};
use crate::transport::{Substream, Transport, TransportError};

/// One end of an in-memory duplex byte stream.
pub struct MemorySubstream {
    reader: IntoAsyncRead<BoxStream<'static, io::Result<Vec<u8>>>>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Two connected substream ends. Dropping or closing one ends the other's reads.
pub fn memory_pair() -> (MemorySubstream, MemorySubstream) {
    let (a_tx, a_rx) = mpsc::unbounded::<Vec<u8>>();
    let (b_tx, b_rx) = mpsc::unbounded::<Vec<u8>>();
    let end = |rx: mpsc::UnboundedReceiver<Vec<u8>>, tx| MemorySubstream {
        reader: rx.map(Ok::<_, io::Error>).boxed().into_async_read(),
        writer: Some(tx),
    };
    (end(b_rx, a_tx), end(a_rx, b_tx))
}

impl AsyncRead for MemorySubstream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemorySubstream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let result = match &self.writer {
            Some(tx) => tx
                .unbounded_send(buf.to_vec())
                .map(|_| buf.len())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        };
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.take();
        Poll::Ready(Ok(()))
    }
}

/// What a scripted responder does next.
#[derive(Clone, Debug)]
pub enum ServerStep {
    /// Write these bytes.
    Send(Vec<u8>),
    Sleep(Duration),
    /// Keep the stream open and never write again.
    Hang,
}

/// A successful response item carrying `value` under `fork`'s context.
pub fn success_item<T: Serialize>(spec: &ChainSpec, fork: ForkName, value: &T) -> ServerStep {
    let fork = spec.fork(fork).expect("fork is scheduled");
    let payload = JsonPayloadCodec::encode(value).expect("fixture serializes");
    ServerStep::Send(encode_response_item(
        ResponseCode::Success,
        Some(spec.fork_digest(fork)),
        &payload,
    ))
}

pub fn error_item(code: ResponseCode, message: &str) -> ServerStep {
    ServerStep::Send(encode_error_response(code, message))
}

type Handler = Arc<dyn Fn(Request) -> Vec<ServerStep> + Send + Sync>;

struct MockPeer {
    handler: Handler,
    answers_ping: bool,
}

#[derive(Default)]
struct MockState {
    peers: HashMap<PeerId, MockPeer>,
    connected: HashSet<PeerId>,
    dialed: Vec<PeerId>,
    disconnected: Vec<PeerId>,
}

/// A transport whose peers are closures from request to scripted response.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialable peer. It does not speak the ping protocol.
    pub fn add_peer<F>(&self, peer: PeerId, handler: F)
    where
        F: Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static,
    {
        self.insert(peer, Arc::new(handler), false);
    }

    /// Register a dialable peer that also answers pings with its sequence number.
    pub fn add_pinging_peer<F>(&self, peer: PeerId, handler: F)
    where
        F: Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static,
    {
        self.insert(peer, Arc::new(handler), true);
    }

    fn insert(&self, peer: PeerId, handler: Handler, answers_ping: bool) {
        self.state.lock().peers.insert(
            peer,
            MockPeer {
                handler,
                answers_ping,
            },
        );
    }

    /// Forget a peer entirely, as if it went offline.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.peers.remove(peer);
        state.connected.remove(peer);
    }

    pub fn dialed(&self) -> Vec<PeerId> {
        self.state.lock().dialed.clone()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.state.lock().disconnected.clone()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state.lock().connected.contains(peer)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, peer: PeerId, _addresses: &[Multiaddr]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.dialed.push(peer);
        if !state.peers.contains_key(&peer) {
            return Err(TransportError::DialFailed {
                peer,
                reason: "unreachable".into(),
            });
        }
        state.connected.insert(peer);
        Ok(())
    }

    async fn disconnect(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state.connected.remove(&peer);
        state.disconnected.push(peer);
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol_id: &str,
    ) -> Result<Box<dyn Substream>, TransportError> {
        let (handler, answers_ping) = {
            let state = self.state.lock();
            if !state.connected.contains(&peer) {
                return Err(TransportError::NotConnected(peer));
            }
            let mock = state
                .peers
                .get(&peer)
                .ok_or(TransportError::NotConnected(peer))?;
            (mock.handler.clone(), mock.answers_ping)
        };

        let protocol = Protocol::from_protocol_id(protocol_id)
            .filter(|protocol| *protocol != Protocol::Ping || answers_ping)
            .ok_or_else(|| TransportError::UnsupportedProtocol(protocol_id.to_string()))?;

        let (client, mut server) = memory_pair();
        tokio::spawn(async move {
            let Ok(request) = read_request(&mut server, protocol).await else {
                return;
            };
            let steps = match request {
                Request::Ping { seq_number } => vec![ServerStep::Send(encode_response_item(
                    ResponseCode::Success,
                    None,
                    &seq_number.to_le_bytes(),
                ))],
                request => handler(request),
            };
            for step in steps {
                match step {
                    ServerStep::Send(bytes) => {
                        if server.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    ServerStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ServerStep::Hang => futures::future::pending::<()>().await,
                }
            }
            let _ = server.close().await;
        });
        Ok(Box::new(client))
    }
}

/// Discovery fed by hand.
pub struct MockDiscovery {
    sender: mpsc::UnboundedSender<DiscoveredRecord>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DiscoveredRecord>>>,
    queries: AtomicUsize,
}

impl MockDiscovery {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, record: DiscoveredRecord) {
        let _ = self.sender.unbounded_send(record);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl Default for MockDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    fn records(&self) -> BoxStream<'static, DiscoveredRecord> {
        match self.receiver.lock().take() {
            Some(receiver) => receiver.boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn trigger_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records subscriptions and nothing else.
#[derive(Debug, Default)]
pub struct MockBroadcast {
    topics: Mutex<BTreeSet<String>>,
}

impl MockBroadcast {
    /// Topics currently subscribed.
    pub fn subscribed(&self) -> BTreeSet<String> {
        self.topics.lock().clone()
    }
}

#[async_trait]
impl Broadcast for MockBroadcast {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().remove(topic);
        Ok(())
    }
}
