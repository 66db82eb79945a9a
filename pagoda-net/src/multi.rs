use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::future::Future;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{NetError, StreamId};
use async_smux::{MuxBuilder, MuxStream};
use async_trait::async_trait;
use futures::stream::{FuturesOrdered, FuturesUnordered};
use futures::{SinkExt, StreamExt, TryStreamExt};
use log::trace;
use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::ProcessGroup;

pub type WrappedStream<T> = Framed<T, LengthDelimitedCodec>;

pub fn wrap_stream<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_type::<u32>()
        .new_framed(stream)
}

pub struct Peer<IO: AsyncRead + AsyncWrite + Unpin> {
    pub id: u32,
    pub listen_addr: SocketAddr,
    pub streams: Option<Vec<TokioMutex<WrappedMuxStream<IO>>>>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Debug for Peer<IO> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut f = f.debug_struct("Peer");
        f.field("id", &self.id);
        f.field("listen_addr", &self.listen_addr);
        f.field("streams", &self.streams.is_some());
        f.finish()
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Clone for Peer<IO> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listen_addr: self.listen_addr,
            streams: None,
        }
    }
}

pub type WrappedMuxStream<T> = Framed<MuxStream<T>, LengthDelimitedCodec>;
pub const MULTIPLEXED_STREAMS: usize = 3;

/// Should be called immediately after making a connection to a peer.
pub async fn multiplex_stream<T: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    channels: usize,
    is_server: bool,
    stream: T,
) -> Result<Vec<TokioMutex<WrappedMuxStream<T>>>, NetError> {
    if is_server {
        let (_connector, mut acceptor, worker) =
            MuxBuilder::server().with_connection(stream).build();
        tokio::spawn(worker);
        let mut ret = Vec::new();
        for _ in 0..channels {
            ret.push(TokioMutex::new(wrap_stream(acceptor.accept().await.ok_or(
                NetError::BadInput {
                    err: "error accepting multiplexed channel",
                },
            )?)));
        }

        Ok(ret)
    } else {
        let (connector, _acceptor, worker) = MuxBuilder::client().with_connection(stream).build();
        tokio::spawn(worker);
        let mut ret = Vec::new();
        for _ in 0..channels {
            ret.push(TokioMutex::new(wrap_stream(connector.connect()?)));
        }

        Ok(ret)
    }
}

/// Partition `nitems` work items (typically input files) into `ngroups`
/// contiguous, near-equal slices. Leading groups take the remainder.
pub fn group_partition(nitems: usize, ngroups: usize) -> Vec<Range<usize>> {
    let ngroups = ngroups.max(1);
    let base = nitems / ngroups;
    let rem = nitems % ngroups;
    let mut out = Vec::with_capacity(ngroups);
    let mut start = 0;
    for g in 0..ngroups {
        let len = base + usize::from(g < rem);
        out.push(start..start + len);
        start += len;
    }
    out
}

/// Split a host list into `ngroups` independent groups; each slice can then
/// bootstrap its own `GroupConnection`.
pub fn split_hosts(hosts: &[SocketAddr], ngroups: usize) -> Vec<Vec<SocketAddr>> {
    group_partition(hosts.len(), ngroups)
        .into_iter()
        .map(|r| hosts[r].to_vec())
        .collect()
}

#[derive(Default, Debug)]
pub struct GroupConnection<IO: AsyncRead + AsyncWrite + Unpin> {
    pub id: u32,
    pub listener: Option<TcpListener>,
    pub peers: HashMap<u32, Peer<IO>>,
    pub nprocs: usize,
    pub upload: AtomicUsize,
    pub download: AtomicUsize,
}

impl GroupConnection<TcpStream> {
    /// One socket address per line, rank order.
    pub fn init_from_path(path: &Path, id: u32) -> Self {
        let f = BufReader::new(File::open(path).expect("host configuration path"));
        let mut hosts = Vec::new();
        for line in f.lines() {
            let line = line.unwrap();
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                let addr: SocketAddr = trimmed
                    .parse()
                    .unwrap_or_else(|e| panic!("bad socket address: {}:\n{}", trimmed, e));
                hosts.push(addr);
            }
        }
        Self::init_from_hosts(&hosts, id)
    }

    pub fn init_from_hosts(hosts: &[SocketAddr], id: u32) -> Self {
        assert!((id as usize) < hosts.len());
        let mut this = GroupConnection {
            id,
            listener: None,
            peers: Default::default(),
            nprocs: hosts.len(),
            upload: AtomicUsize::new(0),
            download: AtomicUsize::new(0),
        };
        for (peer_id, addr) in hosts.iter().enumerate() {
            this.peers.insert(
                peer_id as u32,
                Peer {
                    id: peer_id as u32,
                    listen_addr: *addr,
                    streams: None,
                },
            );
        }
        this
    }

    pub async fn listen(&mut self) -> Result<(), NetError> {
        let listen_addr = self.peers.get(&self.id).unwrap().listen_addr;
        trace!("Listening on {listen_addr}");
        self.listener = Some(TcpListener::bind(listen_addr).await?);
        Ok(())
    }

    pub async fn connect_to_all(&mut self) -> Result<(), NetError> {
        let n_minus_1 = self.nprocs() - 1;
        let my_id = self.id;

        let peer_addrs = self
            .peers
            .iter()
            .map(|p| (*p.0, p.1.listen_addr))
            .collect::<HashMap<_, _>>();

        let listener = self.listener.take().expect("TcpListener is None");
        let new_peers = Arc::new(Mutex::new(self.peers.clone()));
        let new_peers_server = new_peers.clone();
        let new_peers_client = new_peers.clone();

        // Rank r accepts r inbound connections and dials the n-1-r ranks
        // above it, so every pair ends up with exactly one connection.
        let outbound_connections_i_will_make = n_minus_1 - (my_id as usize);
        let inbound_connections_i_will_make = my_id as usize;

        let server_task = async move {
            for _ in 0..inbound_connections_i_will_make {
                let (mut stream, _peer_addr) = listener.accept().await.map_err(|err| {
                    NetError::Generic(format!("Error accepting connection: {err:?}"))
                })?;

                let peer_id = stream.read_u32().await?;
                // Now, multiplex the stream
                let muxed = multiplex_stream(MULTIPLEXED_STREAMS, true, stream).await?;
                new_peers_server.lock().get_mut(&peer_id).unwrap().streams = Some(muxed);
                trace!("{my_id} connected to peer {peer_id}")
            }

            Ok::<_, NetError>(())
        };

        let client_task = async move {
            // Wait some time for the server tasks to boot up
            tokio::time::sleep(Duration::from_millis(200)).await;
            // Listeners are all active, now, connect us to the ranks above
            for conns_made in 0..outbound_connections_i_will_make {
                let next_peer_to_connect_to = my_id + conns_made as u32 + 1;
                let peer_listen_addr = peer_addrs.get(&next_peer_to_connect_to).unwrap();
                let mut stream = {
                    let mut res = Err(io::Error::new(io::ErrorKind::Other, "Initial error"));
                    for _ in 0..30 {
                        res = TcpStream::connect(peer_listen_addr).await;
                        if res.is_ok() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    res.map_err(|err| {
                        NetError::Generic(format!(
                            "Error connecting to peer {next_peer_to_connect_to}: {err:?}"
                        ))
                    })
                }?;
                stream.write_u32(my_id).await?;

                let muxed = multiplex_stream(MULTIPLEXED_STREAMS, false, stream).await?;
                new_peers_client
                    .lock()
                    .get_mut(&next_peer_to_connect_to)
                    .unwrap()
                    .streams = Some(muxed);
                trace!("{my_id} connected to peer {next_peer_to_connect_to}")
            }

            Ok::<_, NetError>(())
        };

        trace!("Awaiting on client and server task to finish");

        tokio::try_join!(server_task, client_task)?;
        self.peers = Arc::try_unwrap(new_peers).unwrap().into_inner();

        trace!("All connected");

        // Do a round with the root, to be sure everyone is ready
        let genesis_round_channel = StreamId::Control;
        let from_all = self
            .gather_bytes(&[self.id as u8] as &[u8], genesis_round_channel)
            .await?;
        self.scatter_bytes(from_all, genesis_round_channel).await?;

        for peer in &self.peers {
            if peer.0 == &self.id {
                continue;
            }

            if peer.1.streams.is_none() {
                return Err(NetError::Generic(format!("Peer {} has no stream", peer.0)));
            }
        }

        trace!("Done with p2p connection");
        Ok(())
    }
}

/// A full process group on loopback addresses, for tests.
pub struct LocalProcessGroup {
    nodes: HashMap<usize, GroupConnection<TcpStream>>,
}

impl LocalProcessGroup {
    pub async fn new_local_group(nprocs: usize) -> Result<Self, NetError> {
        // Bind every rank's listener first so the addresses are known
        let mut listeners = HashMap::new();
        let mut listen_addrs = Vec::new();
        for rank in 0..nprocs {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listen_addrs.push(listener.local_addr()?);
            listeners.insert(rank, listener);
        }

        // Populate the nodes with peer metadata (do NOT connect yet)
        let mut nodes = HashMap::new();
        for (rank, my_listener) in listeners.into_iter() {
            let mut connection = GroupConnection::init_from_hosts(&listen_addrs, rank as u32);
            connection.listener = Some(my_listener);
            nodes.insert(rank, connection);
        }

        // Connect peers to each other
        trace!("Now running init");
        let futures = FuturesUnordered::new();
        for (rank, mut connection) in nodes.into_iter() {
            futures.push(Box::pin(async move {
                connection.connect_to_all().await?;
                Ok::<_, NetError>((rank, connection))
            }));
        }

        let nodes = futures.try_collect().await?;

        Ok(Self { nodes })
    }

    /// For each rank, run the provided closure with that rank's connection
    /// and a clone of `user_data`; collect the per-rank results in rank
    /// order.
    pub async fn simulate_group_round<
        F: Future<Output = K> + Send,
        K: Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
    >(
        self,
        user_data: U,
        f: impl Fn(GroupConnection<TcpStream>, U) -> F + Send + Sync + Clone + 'static,
    ) -> Vec<K> {
        let mut futures = FuturesOrdered::new();
        let mut sorted_nodes = self.nodes.into_iter().collect::<Vec<_>>();
        sorted_nodes.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, connection) in sorted_nodes {
            let next_f = f.clone();
            let next_user_data = user_data.clone();
            futures.push_back(Box::pin(async move {
                let task = async move { next_f(connection, next_user_data).await };
                let handle = tokio::task::spawn(task);
                handle.await.unwrap()
            }));
        }
        futures.collect().await
    }

    pub fn get_connection(&self, rank: usize) -> &GroupConnection<TcpStream> {
        self.nodes.get(&rank).unwrap()
    }
}

#[async_trait]
impl<IO: AsyncRead + AsyncWrite + Unpin + Send> ProcessGroup for GroupConnection<IO> {
    fn nprocs(&self) -> usize {
        self.nprocs
    }

    fn rank(&self) -> u32 {
        self.id
    }

    fn is_init(&self) -> bool {
        self.peers.iter().all(|r| r.1.streams.is_some())
    }

    fn get_comm(&self) -> (usize, usize) {
        (
            self.upload.load(Ordering::Relaxed),
            self.download.load(Ordering::Relaxed),
        )
    }
    fn add_comm(&self, up: usize, down: usize) {
        self.upload.fetch_add(up, Ordering::Relaxed);
        self.download.fetch_add(down, Ordering::Relaxed);
    }

    async fn recv_from(&self, id: u32, sid: StreamId) -> Result<Bytes, NetError> {
        let peer = self
            .peers
            .get(&id)
            .ok_or_else(|| NetError::Generic(format!("Peer {} not found", id)))?;
        let result = recv_stream(peer.streams.as_ref(), sid).await;
        if let Ok(bytes) = &result {
            self.download.fetch_add(bytes.len(), Ordering::Relaxed);
        }
        result
    }

    async fn send_to(&self, id: u32, bytes: Bytes, sid: StreamId) -> Result<(), NetError> {
        let peer = self
            .peers
            .get(&id)
            .ok_or_else(|| NetError::Generic(format!("Peer {} not found", id)))?;
        let len = bytes.len();
        let result = send_stream(peer.streams.as_ref(), bytes, sid).await;
        if result.is_ok() {
            self.upload.fetch_add(len, Ordering::Relaxed);
        }
        result
    }
}

async fn send_stream<T: AsyncRead + AsyncWrite + Unpin>(
    stream: Option<&Vec<TokioMutex<WrappedStream<T>>>>,
    bytes: Bytes,
    sid: StreamId,
) -> Result<(), NetError> {
    if let Some(stream) = stream.and_then(|r| r.get(sid as usize)) {
        Ok(stream.lock().await.send(bytes).await?)
    } else {
        Err(NetError::NotConnected)
    }
}

async fn recv_stream<T: AsyncRead + AsyncWrite + Unpin>(
    stream: Option<&Vec<TokioMutex<WrappedStream<T>>>>,
    sid: StreamId,
) -> Result<Bytes, NetError> {
    if let Some(stream) = stream.and_then(|r| r.get(sid as usize)) {
        Ok(stream
            .lock()
            .await
            .next()
            .await
            .ok_or_else(|| NetError::Generic("Stream died".to_string()))??
            .freeze())
    } else {
        Err(NetError::NotConnected)
    }
}
