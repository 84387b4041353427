//! feedd server - main service loop
//!
//! Accepts and dials peers, runs the hello handshake, and pumps frames
//! between each connection and the [`SyncProtocol`].

use crate::config::{Config, NodeState};
use crate::storage::{Storage, StorageError};
use crate::sync::{Outcome, Session, SyncError, SyncProtocol, SyncStats};
use rln_feed_core::epoch::{unix_now, unix_now_f64};
use rln_feed_core::proof::HashProofSystem;
use rln_feed_core::{IdentitySecret, MemberId, PayloadHash, ProofSystem};
use rln_feed_net::{
    BackfillBatch, BackfillRequest, Connection, Frame, FrameType, KeyPair, PeerId, Transport,
    TransportError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Server state
pub struct Server {
    config: Config,
    identity: IdentitySecret,
    storage: Arc<Storage>,
    sync: Arc<SyncProtocol>,
    transport: Arc<Transport>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Frames queued to peers by event forwarding
    forwarded: AtomicU64,
}

impl Server {
    /// Create a server proving with the hash-based development prover
    pub fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let group = config
            .group()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Self::with_proof_system(config, Arc::new(HashProofSystem::new(group)))
    }

    /// Create a server with an explicit proof system
    pub fn with_proof_system(
        config: Config,
        proofs: Arc<dyn ProofSystem>,
    ) -> Result<Arc<Self>, ServerError> {
        let config_err = |e: anyhow::Error| ServerError::Config(e.to_string());
        let group = config.group().map_err(config_err)?;
        let keys = config.topic_keys().map_err(config_err)?;
        let identity_override = config.identity().map_err(config_err)?;

        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let state = match storage.load_node_state()? {
            Some(state) => state,
            None => {
                let state = NodeState {
                    keypair_seed: KeyPair::generate().seed(),
                    identity_secret: identity_override
                        .clone()
                        .unwrap_or_else(IdentitySecret::generate)
                        .0,
                };
                storage.save_node_state(&state)?;
                info!("Generated new node state");
                state
            }
        };
        let identity = identity_override.unwrap_or(IdentitySecret(state.identity_secret));

        let keypair = KeyPair::from_seed(&state.keypair_seed);
        let transport = Arc::new(Transport::new(
            keypair,
            config.topics.clone(),
            Duration::from_secs(config.handshake_timeout_secs),
        ));
        let local_member = transport.our_id().member_tag();

        let sync = Arc::new(SyncProtocol::new(
            config.sync_config(),
            group,
            proofs,
            storage.clone(),
            local_member,
            &config.topics,
            &keys,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            identity,
            storage,
            sync,
            transport,
            shutdown_tx,
            forwarded: AtomicU64::new(0),
        }))
    }

    /// Our transport identity
    pub fn peer_id(&self) -> PeerId {
        self.transport.our_id()
    }

    pub fn sync(&self) -> &Arc<SyncProtocol> {
        &self.sync
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            addr = %listener.local_addr()?,
            peer = %self.peer_id(),
            topics = ?self.config.topics,
            "feedd listening"
        );

        let tick_handle = self.spawn_tick_task();

        for addr in self.config.bootstrap.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                match server.connect(addr).await {
                    Ok(peer) => info!(%addr, %peer, "connected to bootstrap peer"),
                    Err(e) => warn!(%addr, error = %e, "bootstrap dial failed"),
                }
            });
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.accept(stream).await {
                                    warn!(%addr, error = %e, "inbound session failed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        tick_handle.abort();
        for peer in self.transport.connected_peers() {
            self.transport.unregister(&peer);
        }
        self.storage.flush()?;
        Ok(())
    }

    /// Dial a peer and start a session with it
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, ServerError> {
        let (conn, mut inbound) = self.transport.connect(addr).await?;
        let session = self.establish(&conn, &mut inbound).await?;
        let peer = session.peer().ok_or(TransportError::ConnectionClosed)?;
        tokio::spawn(self.clone().run_session(conn, inbound, session));
        Ok(peer)
    }

    async fn accept(self: Arc<Self>, stream: TcpStream) -> Result<(), ServerError> {
        let (conn, mut inbound) = Connection::spawn(stream)?;
        let session = self.establish(&conn, &mut inbound).await?;
        self.run_session(conn, inbound, session).await;
        Ok(())
    }

    /// Handshake, register, and open the session with our renewal and one
    /// backfill request per shared topic.
    async fn establish(
        &self,
        conn: &Arc<Connection>,
        inbound: &mut mpsc::Receiver<Frame>,
    ) -> Result<Session, ServerError> {
        let info = match self.transport.handshake(conn, inbound, unix_now()).await {
            Ok(info) => info,
            Err(e) => {
                conn.close();
                return Err(e.into());
            }
        };
        let id = match self.transport.register(conn.clone()) {
            Ok(id) => id,
            Err(e) => {
                conn.close();
                return Err(e.into());
            }
        };

        let shared: Vec<String> = self
            .sync
            .topics()
            .filter(|topic| info.subscribes(topic))
            .map(str::to_string)
            .collect();
        let session = Session::new(id.member_tag(), Some(id), shared, conn.liveness());
        info!(peer = %id, addr = %conn.addr, topics = ?session.topics(), "peer connected");

        let greeting = async {
            let renewal = self.sync.renewal(&self.identity, unix_now())?;
            conn.send(Frame::peer(renewal)).await?;
            for topic in session.topics() {
                let request = self.sync.backfill_request(topic)?;
                conn.send(request.to_frame()?).await?;
            }
            Ok::<_, ServerError>(())
        };
        if let Err(e) = greeting.await {
            self.transport.unregister(&id);
            return Err(e);
        }
        Ok(session)
    }

    async fn run_session(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut inbound: mpsc::Receiver<Frame>,
        session: Session,
    ) {
        while let Some(frame) = inbound.recv().await {
            if let Err(e) = self.handle_frame(&conn, &session, frame).await {
                warn!(addr = %conn.addr, error = %e, "session error");
                break;
            }
        }

        session.close();
        conn.close();
        if let Some(id) = session.peer() {
            let ours = self
                .transport
                .get_connection(&id)
                .map(|current| Arc::ptr_eq(&current, &conn))
                .unwrap_or(false);
            if ours {
                self.transport.unregister(&id);
            }
            info!(peer = %id, "peer disconnected");
        }
    }

    async fn handle_frame(
        &self,
        conn: &Connection,
        session: &Session,
        frame: Frame,
    ) -> Result<(), ServerError> {
        match frame.frame_type {
            FrameType::Ping => conn.send(Frame::pong()).await?,
            FrameType::Pong => {}
            FrameType::Hello => debug!(addr = %conn.addr, "ignoring repeated hello"),
            FrameType::Peer => {
                if let Outcome::Stored {
                    topic,
                    payload_hash,
                    forward,
                } = self.sync.handle_message(session, &frame.payload).await?
                {
                    let sent = self
                        .transport
                        .broadcast(&topic, Frame::peer(forward), session.peer())
                        .await;
                    self.forwarded.fetch_add(sent as u64, Ordering::Relaxed);
                    debug!(%topic, payload = %payload_hash, peers = sent, "forwarded event");
                }
            }
            FrameType::BackfillRequest => {
                let request = BackfillRequest::from_frame(&frame)?;
                let batch = self.sync.handle_backfill_request_for(session, &request)?;
                conn.send(batch.to_frame()?).await?;
            }
            FrameType::BackfillBatch => {
                let batch = BackfillBatch::from_frame(&frame)?;
                let topic = batch.topic.clone();
                let progress = self
                    .sync
                    .apply_backfill(session, batch, unix_now_f64())
                    .await?;
                debug!(
                    %topic,
                    applied = progress.applied,
                    known = progress.known,
                    dropped = progress.dropped,
                    "applied backfill batch"
                );
                if let Some(next) = progress.next {
                    conn.send(next.to_frame()?).await?;
                }
            }
        }
        Ok(())
    }

    /// Spawn periodic membership maintenance and renewal
    fn spawn_tick_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(server.config.tick_interval_secs));
            let mut renewed_epoch = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = unix_now();
                        let purged = server.sync.tick(now);
                        if purged > 0 {
                            info!(purged, "purged expired members");
                        }
                        let epoch = server.sync.params().membership_epoch(now);
                        if renewed_epoch != Some(epoch) {
                            match server.renew(now).await {
                                Ok(peers) => {
                                    debug!(epoch, peers, "renewed membership");
                                    renewed_epoch = Some(epoch);
                                }
                                Err(e) => warn!(epoch, error = %e, "membership renewal failed"),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Book our own renewal locally and announce it to every peer
    async fn renew(&self, now: u64) -> Result<usize, ServerError> {
        let bytes = self.sync.renewal(&self.identity, now)?;
        let local = Session::local(self.sync.local_member(), self.config.topics.clone());
        self.sync
            .handle_message_at(&local, &bytes, now as f64)
            .await?;
        Ok(self.transport.broadcast_all(Frame::peer(bytes)).await)
    }

    /// Publish `content` on `topic` and send it to subscribed peers
    pub async fn publish(&self, topic: &str, content: &[u8]) -> Result<PayloadHash, ServerError> {
        let published = self
            .sync
            .publish(
                topic,
                content,
                &self.identity,
                &self.config.claimed_sender,
                unix_now_f64(),
            )
            .await?;
        let peers = self
            .transport
            .broadcast(topic, Frame::peer(published.bytes), None)
            .await;
        debug!(topic, payload = %published.payload_hash, peers, "sent published event");
        Ok(published.payload_hash)
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            peer_count: self
                .transport
                .connected_peers()
                .iter()
                .filter(|id| self.transport.is_connected(id))
                .count(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            member: self.sync.local_member(),
            sync: self.sync.stats(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub peer_count: usize,
    pub forwarded: u64,
    pub member: MemberId,
    pub sync: SyncStats,
}
