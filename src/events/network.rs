// Copyright 2020 The Arbor Core Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, format_err};
use futures::{channel::mpsc, future, prelude::*};
use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use rand::{thread_rng, Rng};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    ops,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    events::codec::MessagesCodec,
    helpers::MemberId,
    messages::{Connect, Message},
    NetworkConfiguration,
};

const OUTGOING_CHANNEL_SIZE: usize = 10;

#[derive(Debug)]
struct ErrorAction {
    retry_timeout: Duration,
    max_retries: usize,
    description: String,
}

impl ErrorAction {
    fn new(config: &NetworkConfiguration, description: String) -> Self {
        Self {
            retry_timeout: Duration::from_millis(config.tcp_connect_retry_timeout),
            max_retries: config.tcp_connect_max_retries as usize,
            description,
        }
    }
}

impl ErrorHandler<io::Error> for ErrorAction {
    type OutError = io::Error;

    fn handle(&mut self, attempt: usize, e: io::Error) -> RetryPolicy<io::Error> {
        log::info!(
            "{} failed [Attempt: {}/{}]: {}",
            self.description,
            attempt,
            self.max_retries,
            e
        );

        if attempt >= self.max_retries {
            RetryPolicy::ForwardError(e)
        } else {
            let jitter = thread_rng().gen_range(0.5..1.0);
            let timeout = self.retry_timeout.mul_f64(jitter);
            RetryPolicy::WaitRetry(timeout)
        }
    }
}

/// Address of an established peer link.
#[derive(Debug, Clone)]
pub enum ConnectedPeerAddr {
    In(SocketAddr),
    Out(String, SocketAddr),
}

impl ConnectedPeerAddr {
    pub fn is_incoming(&self) -> bool {
        match self {
            Self::In(_) => true,
            Self::Out(_, _) => false,
        }
    }
}

/// Events from the network layer to the supervisor.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum NetworkEvent {
    /// A framed message arrived from the peer advertising the given miner
    /// identity.
    MessageReceived(MemberId, Message),
    /// A peer link was established and identified.
    PeerConnected(ConnectedPeerAddr, Connect),
    /// The link to a peer went down.
    PeerDisconnected(MemberId),
    /// An outbound connection could not be established.
    UnableConnectToPeer(MemberId),
}

/// Requests to the network layer.
#[derive(Debug, Clone)]
pub enum NetworkRequest {
    /// Flood a message to every connected peer (invitation relay).
    Broadcast(Message),
    /// Drop the link to a peer.
    DisconnectWithPeer(MemberId),
}

#[derive(Clone, Debug)]
struct ConnectionPoolEntry {
    sender: mpsc::Sender<Message>,
    address: ConnectedPeerAddr,
    // Connection ID assigned during instantiation; used to ignore removal
    // requests that have been obsoleted by a reconnect.
    id: u64,
}

/// Connection pool shared between the listener, the outbound connector and
/// the committee overlay. Keyed by the advertised miner identity.
#[derive(Clone, Debug)]
pub struct SharedConnectionPool {
    inner: Arc<RwLock<ConnectionPool>>,
}

impl SharedConnectionPool {
    pub fn new(our_id: MemberId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConnectionPool::new(our_id))),
        }
    }

    fn read(&self) -> impl ops::Deref<Target = ConnectionPool> + '_ {
        self.inner.read().unwrap()
    }

    fn write(&self) -> impl ops::DerefMut<Target = ConnectionPool> + '_ {
        self.inner.write().unwrap()
    }

    /// Whether a peer advertising the given identity is connected.
    pub fn contains(&self, member: &MemberId) -> bool {
        self.read().peers.contains_key(member)
    }

    /// Pushes a message onto the connection of the given member.
    ///
    /// Returns `false` when no live connection exists; a dead connection is
    /// dropped from the pool.
    pub async fn send_message(&self, member: &MemberId, message: Message) -> bool {
        let maybe_peer_info = {
            // Ensure that we don't hold the lock across the `await` point.
            let peers = &self.read().peers;
            peers
                .get(member)
                .map(|peer| (peer.sender.clone(), peer.id))
        };

        if let Some((mut sender, connection_id)) = maybe_peer_info {
            if sender.send(message).await.is_err() {
                log::warn!("Cannot send message to peer {}", member);
                self.write().remove(member, Some(connection_id));
                return false;
            }
            return true;
        }
        false
    }

    /// Pushes a message onto every pooled connection except `exclude`.
    pub async fn broadcast(&self, message: &Message, exclude: Option<&MemberId>) {
        let senders: Vec<_> = {
            let peers = &self.read().peers;
            peers
                .iter()
                .filter(|(member, _)| Some(*member) != exclude)
                .map(|(member, peer)| (*member, peer.sender.clone(), peer.id))
                .collect()
        };

        for (member, mut sender, connection_id) in senders {
            if sender.send(message.clone()).await.is_err() {
                self.write().remove(&member, Some(connection_id));
            }
        }
    }

    fn create_connection(
        &self,
        member: MemberId,
        address: ConnectedPeerAddr,
        socket: Framed<TcpStream, MessagesCodec>,
    ) -> Option<Connection> {
        let mut guard = self.write();

        if guard.contains(&member) && Self::ignore_connection(guard.our_id, member) {
            log::info!("Ignoring connection to {} per priority rules", member);
            return None;
        }

        let (receiver_rx, connection_id) = guard.add(member, address.clone());
        Some(Connection {
            socket,
            receiver_rx,
            address,
            member,
            id: connection_id,
        })
    }

    /// Complete anti-symmetric relation deciding which of two simultaneous
    /// connections between the same pair of peers survives.
    fn ignore_connection(our_id: MemberId, their_id: MemberId) -> bool {
        our_id.as_bytes() < their_id.as_bytes()
    }
}

#[derive(Debug)]
struct ConnectionPool {
    peers: HashMap<MemberId, ConnectionPoolEntry>,
    our_id: MemberId,
    next_connection_id: u64,
}

impl ConnectionPool {
    fn new(our_id: MemberId) -> Self {
        Self {
            peers: HashMap::new(),
            our_id,
            next_connection_id: 0,
        }
    }

    fn count_incoming(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| entry.address.is_incoming())
            .count()
    }

    fn count_outgoing(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| !entry.address.is_incoming())
            .count()
    }

    fn add(&mut self, member: MemberId, address: ConnectedPeerAddr) -> (mpsc::Receiver<Message>, u64) {
        let id = self.next_connection_id;
        let (sender, receiver_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
        let entry = ConnectionPoolEntry {
            sender,
            address,
            id,
        };

        self.next_connection_id += 1;
        self.peers.insert(member, entry);
        (receiver_rx, id)
    }

    fn contains(&self, member: &MemberId) -> bool {
        self.peers.get(member).is_some()
    }

    /// Drops the connection to a peer, optionally filtered by connection ID
    /// to avoid acting on obsolete requests.
    fn remove(&mut self, member: &MemberId, connection_id: Option<u64>) -> bool {
        if let Some(entry) = self.peers.get(member) {
            if connection_id.map_or(true, |id| id == entry.id) {
                self.peers.remove(member);
                return true;
            }
        }
        false
    }
}

struct Connection {
    socket: Framed<TcpStream, MessagesCodec>,
    receiver_rx: mpsc::Receiver<Message>,
    address: ConnectedPeerAddr,
    member: MemberId,
    id: u64,
}

/// Shared handle to the network layer: accepts inbound links, dials members
/// and feeds decoded messages to the supervisor.
#[derive(Clone)]
pub struct NetworkHandler {
    listen_address: SocketAddr,
    pool: SharedConnectionPool,
    network_config: NetworkConfiguration,
    network_tx: mpsc::Sender<NetworkEvent>,
    our_connect: Connect,
    max_message_len: u32,
}

impl NetworkHandler {
    pub fn new(
        listen_address: SocketAddr,
        pool: SharedConnectionPool,
        network_config: NetworkConfiguration,
        network_tx: mpsc::Sender<NetworkEvent>,
        our_connect: Connect,
        max_message_len: u32,
    ) -> Self {
        Self {
            listen_address,
            pool,
            network_config,
            network_tx,
            our_connect,
            max_message_len,
        }
    }

    /// Pool of established peer links.
    pub fn pool(&self) -> &SharedConnectionPool {
        &self.pool
    }

    async fn listener(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_address).await?;
        let incoming_connections_limit = self.network_config.max_incoming_connections;

        loop {
            let (socket, peer_address) = listener.accept().await?;

            let connections_count = self.pool.read().count_incoming();
            if connections_count >= incoming_connections_limit {
                log::warn!(
                    "Rejected incoming connection with peer={}, connections limit reached.",
                    peer_address
                );
                continue;
            }

            let pool = self.pool.clone();
            let network_tx = self.network_tx.clone();
            let our_connect = self.our_connect.clone();
            let max_message_len = self.max_message_len;
            let network_config = self.network_config;

            let task = async move {
                Self::configure_socket(&socket, network_config)?;
                let mut framed = Framed::new(socket, MessagesCodec::new(max_message_len));

                // The initiator speaks first; identify ourselves in return.
                let connect = expect_connect(&mut framed).await?;
                framed.send(Message::Connect(our_connect)).await?;

                let conn_addr = ConnectedPeerAddr::In(peer_address);
                let member = connect.member;
                let maybe_connection = pool.create_connection(member, conn_addr, framed);
                if let Some(connection) = maybe_connection {
                    Self::handle_connection(connection, connect, pool, network_tx).await
                } else {
                    Ok(())
                }
            };

            tokio::spawn(task.unwrap_or_else(|err: anyhow::Error| log::warn!("{}", err)));
        }
    }

    /// Establishes an outbound connection to a member at the given address.
    ///
    /// The returned future resolves when the link is identified; connection
    /// processing is spawned onto the runtime.
    pub async fn connect(&self, member: MemberId, unresolved_address: &str) -> anyhow::Result<()> {
        let max_connections = self.network_config.max_outgoing_connections;
        let pool = self.pool.clone();
        let mut network_tx = self.network_tx.clone();
        let network_config = self.network_config;
        let description = format!(
            "Connecting to {} (remote address = {})",
            member, unresolved_address
        );
        let on_error = ErrorAction::new(&network_config, description);

        let connect_attempt = || TcpStream::connect(unresolved_address.to_owned());
        // The second component of the returned value is the number of
        // retries, which we ignore.
        let socket = match FutureRetry::new(connect_attempt, on_error).await {
            Ok((socket, _)) => socket,
            Err((err, _)) => {
                network_tx
                    .send(NetworkEvent::UnableConnectToPeer(member))
                    .await
                    .ok();
                return Err(err.into());
            }
        };

        let peer_address = socket
            .peer_addr()
            .map_err(|err| format_err!("Couldn't take peer addr from socket: {}", err))?;
        Self::configure_socket(&socket, network_config)?;

        let mut framed = Framed::new(socket, MessagesCodec::new(self.max_message_len));
        framed.send(Message::Connect(self.our_connect.clone())).await?;
        let connect = expect_connect(&mut framed).await?;

        if connect.member != member {
            bail!(
                "Peer at {} advertised identity {}, expected {}",
                unresolved_address,
                connect.member,
                member
            );
        }

        if pool.read().count_outgoing() >= max_connections {
            log::info!(
                "Ignoring outgoing connection to {} because the connection limit ({}) is reached",
                member,
                max_connections
            );
            return Ok(());
        }

        let conn_addr = ConnectedPeerAddr::Out(unresolved_address.to_owned(), peer_address);
        if let Some(connection) = pool.create_connection(member, conn_addr, framed) {
            let handler = Self::handle_connection(connection, connect, pool, network_tx);
            tokio::spawn(handler.unwrap_or_else(|err| log::warn!("{}", err)));
        }
        Ok(())
    }

    async fn process_messages(
        pool: SharedConnectionPool,
        connection: Connection,
        mut network_tx: mpsc::Sender<NetworkEvent>,
    ) {
        let (sink, stream) = connection.socket.split();
        let member = connection.member;
        let connection_id = connection.id;

        // Processing of incoming messages.
        let incoming = async move {
            let res = (&mut network_tx)
                .sink_map_err(|err| format_err!("cannot deliver network event: {}", err))
                .send_all(
                    &mut stream.map_ok(move |message| NetworkEvent::MessageReceived(member, message)),
                )
                .await;
            if pool.write().remove(&member, Some(connection_id)) {
                network_tx
                    .send(NetworkEvent::PeerDisconnected(member))
                    .await
                    .ok();
            }
            res
        };
        futures::pin_mut!(incoming);

        // Processing of outgoing messages.
        let outgoing = connection.receiver_rx.map(Ok).forward(sink);

        // Select the first future to terminate and drop the remaining one.
        let task = future::select(incoming, outgoing).map(move |res| {
            if let (Err(err), _) = res.factor_first() {
                log::info!("Connection with peer {} terminated: {}", member, err);
            }
        });
        task.await;
    }

    fn configure_socket(
        socket: &TcpStream,
        network_config: NetworkConfiguration,
    ) -> anyhow::Result<()> {
        socket.set_nodelay(network_config.tcp_nodelay)?;
        if let Some(timeout) = network_config.tcp_keep_alive {
            let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_millis(timeout));
            socket2::SockRef::from(socket).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }

    async fn handle_connection(
        connection: Connection,
        connect: Connect,
        pool: SharedConnectionPool,
        mut network_tx: mpsc::Sender<NetworkEvent>,
    ) -> anyhow::Result<()> {
        let address = connection.address.clone();
        log::trace!("Established connection with peer {:?}", address);

        network_tx
            .send(NetworkEvent::PeerConnected(address, connect))
            .await
            .map_err(|_| format_err!("Cannot send `PeerConnected` notification"))?;
        Self::process_messages(pool, connection, network_tx).await;
        Ok(())
    }

    pub async fn handle_requests(self, mut receiver: mpsc::Receiver<NetworkRequest>) {
        while let Some(request) = receiver.next().await {
            match request {
                NetworkRequest::Broadcast(message) => {
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        pool.broadcast(&message, None).await;
                    });
                }

                NetworkRequest::DisconnectWithPeer(member) => {
                    let disconnected = self.pool.write().remove(&member, None);
                    if disconnected {
                        let mut network_tx = self.network_tx.clone();
                        tokio::spawn(async move {
                            network_tx
                                .send(NetworkEvent::PeerDisconnected(member))
                                .await
                                .ok();
                        });
                    }
                }
            }
        }
    }
}

/// Reads the first frame of a fresh link, which must identify the peer.
async fn expect_connect(framed: &mut Framed<TcpStream, MessagesCodec>) -> anyhow::Result<Connect> {
    let first = framed
        .next()
        .await
        .ok_or_else(|| format_err!("peer closed the link before identifying itself"))??;
    match first {
        Message::Connect(connect) => Ok(connect),
        other => bail!(
            "First message from a remote peer is not `connect`, got={:?}",
            other
        ),
    }
}

/// Network half of the node: the listener plus the request loop.
pub struct NetworkPart {
    pub handler: NetworkHandler,
    pub network_requests: mpsc::Receiver<NetworkRequest>,
}

impl NetworkPart {
    pub async fn run(self) {
        let listener = self.handler.clone().listener().unwrap_or_else(|e| {
            log::error!("Listening to incoming peer connections failed: {}", e);
        });
        futures::pin_mut!(listener);
        let request_handler = self.handler.handle_requests(self.network_requests);
        futures::pin_mut!(request_handler);

        future::select(listener, request_handler).await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn member(byte: u8) -> MemberId {
        MemberId([byte; 20])
    }

    #[test]
    fn pool_removal_respects_connection_ids() {
        let pool = SharedConnectionPool::new(member(0));
        let addr = ConnectedPeerAddr::In("127.0.0.1:7000".parse().unwrap());
        let (_rx, first_id) = pool.write().add(member(1), addr.clone());
        let (_rx, second_id) = pool.write().add(member(1), addr);
        assert_ne!(first_id, second_id);

        // Obsolete removal request is ignored.
        assert!(!pool.write().remove(&member(1), Some(first_id)));
        assert!(pool.contains(&member(1)));
        assert!(pool.write().remove(&member(1), Some(second_id)));
        assert!(!pool.contains(&member(1)));
    }

    #[test]
    fn simultaneous_connections_resolve_anti_symmetrically() {
        let ours = member(1);
        let theirs = member(2);
        assert_ne!(
            SharedConnectionPool::ignore_connection(ours, theirs),
            SharedConnectionPool::ignore_connection(theirs, ours)
        );
    }

    #[tokio::test]
    async fn send_message_reports_missing_peer() {
        let pool = SharedConnectionPool::new(member(0));
        let message = Message::Connect(Connect {
            member: member(0),
            host: "127.0.0.1:1".to_owned(),
            time: 0,
        });
        assert!(!pool.send_message(&member(5), message).await);
    }
}
