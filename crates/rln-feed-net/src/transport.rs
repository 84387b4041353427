//! TCP transport layer
//!
//! Each connection runs a reader and a writer task over a framed TCP
//! stream. The [`Transport`] keeps the registry of handshaken peers and
//! fans frames out by topic.

use crate::crypto::{CryptoError, KeyPair};
use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::messages::Hello;
use crate::peer::{PeerId, PeerInfo};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Frames queued per connection before senders wait
const OUTBOUND_QUEUE: usize = 256;
/// Frames buffered from the socket before the reader waits
const INBOUND_QUEUE: usize = 256;
/// Maximum age of a hello, in seconds, in either direction
pub const HELLO_MAX_SKEW_SECS: u64 = 300;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake signature invalid: {0}")]
    BadSignature(#[from] CryptoError),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Already connected to peer: {0}")]
    AlreadyConnected(PeerId),
}

/// Connection to a peer
pub struct Connection {
    /// Remote address
    pub addr: SocketAddr,
    /// Send channel
    tx: mpsc::Sender<Frame>,
    /// Is the connection open
    open: Arc<AtomicBool>,
    /// Stops both I/O tasks
    shutdown: watch::Sender<bool>,
    /// Set once the hello exchange completes
    peer: RwLock<Option<PeerInfo>>,
}

impl Connection {
    /// Start I/O tasks for an established stream.
    ///
    /// Returns the connection handle and the queue of inbound frames; the
    /// queue ends when the socket closes.
    pub fn spawn(stream: TcpStream) -> Result<(Arc<Self>, mpsc::Receiver<Frame>), TransportError> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut sink, mut source) = Framed::new(stream, FrameCodec::new()).split();

        let (tx, mut outbound) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let (inbound_tx, inbound) = mpsc::channel::<Frame>(INBOUND_QUEUE);
        let (shutdown, mut writer_stop) = watch::channel(false);
        let mut reader_stop = shutdown.subscribe();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_stop.changed() => break,
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            debug!(%addr, error = %e, "write failed");
                            break;
                        }
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_open = open.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_stop.changed() => break,
                    next = source.next() => match next {
                        Some(Ok(frame)) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%addr, error = %e, "read failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        let conn = Arc::new(Self {
            addr,
            tx,
            open,
            shutdown,
            peer: RwLock::new(None),
        });
        Ok((conn, inbound))
    }

    /// Send a frame to this peer
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Check if connection is open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the connection
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    /// Shared open flag, cleared when either I/O task stops
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// Peer info from the hello, if the handshake finished
    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer.read().clone()
    }

    /// Peer id from the hello, if the handshake finished
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer.read().as_ref().map(|p| p.id)
    }
}

/// Transport layer managing connections
pub struct Transport {
    /// Our keypair
    keypair: KeyPair,
    /// Our peer ID
    our_id: PeerId,
    /// Topics announced in our hello
    topics: Vec<String>,
    /// Handshaken peers
    connections: RwLock<HashMap<PeerId, Arc<Connection>>>,
    /// Bound on dialing and on the hello exchange
    handshake_timeout: Duration,
}

impl Transport {
    /// Create a new transport
    pub fn new(keypair: KeyPair, topics: Vec<String>, handshake_timeout: Duration) -> Self {
        let our_id = PeerId::from_public_key(&keypair.public_key());
        Self {
            keypair,
            our_id,
            topics,
            connections: RwLock::new(HashMap::new()),
            handshake_timeout,
        }
    }

    /// Get our peer ID
    pub fn our_id(&self) -> PeerId {
        self.our_id
    }

    /// Topics we announce
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Dial a peer
    pub async fn connect(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Frame>), TransportError> {
        let stream = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(self.handshake_timeout))??;
        Connection::spawn(stream)
    }

    /// Exchange signed hellos on a fresh connection.
    ///
    /// The first frame from the remote side must be its hello.
    pub async fn handshake(
        &self,
        conn: &Connection,
        inbound: &mut mpsc::Receiver<Frame>,
        now: u64,
    ) -> Result<PeerInfo, TransportError> {
        let ours = Hello::new(&self.keypair, self.topics.clone(), now);
        conn.send(ours.to_frame()?).await?;

        let frame = tokio::time::timeout(self.handshake_timeout, inbound.recv())
            .await
            .map_err(|_| TransportError::Timeout(self.handshake_timeout))?
            .ok_or(TransportError::ConnectionClosed)?;
        if frame.frame_type != FrameType::Hello {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {:?}",
                frame.frame_type
            )));
        }

        let theirs = Hello::from_frame(&frame)?;
        theirs.verify()?;
        if theirs.timestamp.abs_diff(now) > HELLO_MAX_SKEW_SECS {
            return Err(TransportError::Handshake(format!(
                "stale hello timestamp {}",
                theirs.timestamp
            )));
        }
        if theirs.peer_id() == self.our_id {
            return Err(TransportError::Handshake("connected to self".into()));
        }

        let info = PeerInfo::new(theirs.peer_id(), conn.addr, theirs.topics);
        *conn.peer.write() = Some(info.clone());
        Ok(info)
    }

    /// Register a handshaken connection
    pub fn register(&self, conn: Arc<Connection>) -> Result<PeerId, TransportError> {
        let id = conn
            .peer_id()
            .ok_or_else(|| TransportError::Handshake("no hello on connection".into()))?;
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&id) {
            if existing.is_open() {
                return Err(TransportError::AlreadyConnected(id));
            }
        }
        connections.insert(id, conn);
        Ok(id)
    }

    /// Drop a connection from the registry and close it
    pub fn unregister(&self, id: &PeerId) {
        if let Some(conn) = self.connections.write().remove(id) {
            conn.close();
        }
    }

    /// List connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    /// Check if connected to a peer
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.connections
            .read()
            .get(id)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Get a connection to a peer
    pub fn get_connection(&self, id: &PeerId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Send a frame to a peer
    pub async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        let conn = self
            .get_connection(to)
            .ok_or(TransportError::PeerNotFound(*to))?;
        conn.send(frame).await
    }

    /// Send a frame to every open peer subscribed to `topic`, except one.
    ///
    /// Returns the number of peers the frame was queued for.
    pub async fn broadcast(&self, topic: &str, frame: Frame, except: Option<PeerId>) -> usize {
        self.fan_out(frame, |id, conn| {
            Some(*id) != except && conn.peer().map(|p| p.subscribes(topic)).unwrap_or(false)
        })
        .await
    }

    /// Send a frame to every open peer regardless of topics
    pub async fn broadcast_all(&self, frame: Frame) -> usize {
        self.fan_out(frame, |_, _| true).await
    }

    async fn fan_out<F>(&self, frame: Frame, mut select: F) -> usize
    where
        F: FnMut(&PeerId, &Connection) -> bool,
    {
        let targets: Vec<_> = self
            .connections
            .read()
            .iter()
            .filter(|(id, conn)| conn.is_open() && select(id, conn))
            .map(|(_, conn)| conn.clone())
            .collect();

        let mut sent = 0;
        for conn in targets {
            match conn.send(frame.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(addr = %conn.addr, error = %e, "broadcast failed"),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(
        a: &Transport,
        b: &Transport,
    ) -> (
        (Arc<Connection>, mpsc::Receiver<Frame>),
        (Arc<Connection>, mpsc::Receiver<Frame>),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(a.connect(addr), listener.accept());
        let (a_conn, mut a_rx) = dialed.unwrap();
        let (b_conn, mut b_rx) = Connection::spawn(accepted.unwrap().0).unwrap();

        let now = 1_700_000_000;
        let (a_info, b_info) = tokio::join!(
            a.handshake(&a_conn, &mut a_rx, now),
            b.handshake(&b_conn, &mut b_rx, now)
        );
        assert_eq!(a_info.unwrap().id, b.our_id());
        assert_eq!(b_info.unwrap().id, a.our_id());
        ((a_conn, a_rx), (b_conn, b_rx))
    }

    fn transport(seed: u8, topics: &[&str]) -> Transport {
        Transport::new(
            KeyPair::from_seed(&[seed; 32]),
            topics.iter().map(|t| t.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_send() {
        let a = transport(1, &["general"]);
        let b = transport(2, &["general"]);
        let ((a_conn, _a_rx), (_b_conn, mut b_rx)) = pair(&a, &b).await;

        a_conn.send(Frame::peer(vec![7, 7, 7])).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        assert_eq!(frame, Frame::peer(vec![7, 7, 7]));
    }

    #[tokio::test]
    async fn test_broadcast_filters_topic_and_sender() {
        let hub = transport(1, &["general", "dev"]);
        let general = transport(2, &["general"]);
        let dev = transport(3, &["dev"]);

        let ((to_general, _hub_rx1), (_general_conn, mut general_rx)) = pair(&hub, &general).await;
        let ((to_dev, _hub_rx2), _dev_side) = pair(&hub, &dev).await;
        hub.register(to_general).unwrap();
        hub.register(to_dev).unwrap();

        let sent = hub.broadcast("general", Frame::peer(vec![1]), None).await;
        assert_eq!(sent, 1);
        assert_eq!(general_rx.recv().await.unwrap(), Frame::peer(vec![1]));

        let sent = hub
            .broadcast("general", Frame::peer(vec![2]), Some(general.our_id()))
            .await;
        assert_eq!(sent, 0);

        assert_eq!(hub.broadcast_all(Frame::ping()).await, 2);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let a = transport(1, &["general"]);
        let b = transport(2, &["general"]);
        let ((first, _rx1), _b1) = pair(&a, &b).await;
        let ((second, _rx2), _b2) = pair(&a, &b).await;

        let id = a.register(first).unwrap();
        assert!(matches!(
            a.register(second),
            Err(TransportError::AlreadyConnected(_))
        ));

        a.unregister(&id);
        assert!(!a.is_connected(&id));
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_send() {
        let a = transport(1, &["general"]);
        let b = transport(2, &["general"]);
        let ((a_conn, _a_rx), _b_side) = pair(&a, &b).await;

        a_conn.close();
        assert!(!a_conn.is_open());
        assert!(matches!(
            a_conn.send(Frame::ping()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
