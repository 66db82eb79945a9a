pub mod collect;
pub mod multi;
pub mod utils;

use async_trait::async_trait;
use auto_impl::auto_impl;
use futures::stream::FuturesOrdered;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::bytes::Bytes;

pub use collect::{Collectives, GopElem};
pub use multi::LocalProcessGroup;

#[derive(Clone, Debug)]
pub enum NetError {
    Generic(String),
    Protocol { err: String, rank: u32 },
    NotConnected,
    BadInput { err: &'static str },
}

impl<T: ToString> From<T> for NetError {
    fn from(e: T) -> Self {
        NetError::Generic(e.to_string())
    }
}

impl From<NetError> for pagoda_types::PagodaError {
    fn from(e: NetError) -> Self {
        pagoda_types::PagodaError::Net(format!("{:?}", e))
    }
}

/// One of the multiplexed channels carried over each peer connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Copy)]
pub enum StreamId {
    Control = 0,
    Data = 1,
    Io = 2,
}

/// The fixed process group every collective is entered by.
///
/// Rank 0 is the root. Collectives must be reached in identical program
/// order by every rank; a rank with nothing to contribute still enters the
/// call with an empty frame.
#[async_trait]
#[auto_impl(&, &mut, Arc)]
pub trait ProcessGroup: Send + Sync {
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
    /// How many ranks are in the group?
    fn nprocs(&self) -> usize;
    /// This process's rank (0 to nprocs-1).
    fn rank(&self) -> u32;
    /// Is the network layer initialized?
    fn is_init(&self) -> bool;

    /// Get upload/download in bytes.
    fn get_comm(&self) -> (usize, usize);

    fn add_comm(&self, up: usize, down: usize);

    async fn recv_from(&self, id: u32, sid: StreamId) -> Result<Bytes, NetError>;
    async fn send_to(&self, id: u32, bytes: Bytes, sid: StreamId) -> Result<(), NetError>;

    /// All ranks send bytes to the root; the root receives one frame per rank.
    async fn gather_bytes(
        &self,
        bytes: &[u8],
        sid: StreamId,
    ) -> Result<Option<Vec<Bytes>>, NetError> {
        let bytes_out = Bytes::copy_from_slice(bytes);
        let own_id = self.rank();
        let timer = start_timer!(
            format!("Comm: from {} to root, {}B", own_id, bytes_out.len()),
            false
        );

        let r = if self.is_root() {
            let mut r = FuturesOrdered::new();

            for id in 0..self.nprocs() as u32 {
                let bytes_out: Bytes = bytes_out.clone();
                r.push_back(Box::pin(async move {
                    let bytes_in = if id == own_id {
                        bytes_out
                    } else {
                        self.recv_from(id, sid).await?
                    };

                    Ok::<_, NetError>((id, bytes_in))
                }));
            }

            let mut ret: HashMap<u32, Bytes> = r.try_collect().await?;
            let mut sorted_ret = Vec::new();
            for x in 0..self.nprocs() {
                sorted_ret.push(ret.remove(&(x as u32)).unwrap());
            }

            Ok(Some(sorted_ret))
        } else {
            self.send_to(0, bytes_out, sid).await?;
            Ok(None)
        };
        end_timer!(timer);
        r
    }

    /// All ranks receive a frame from the root.
    /// Provide frames iff you are the root.
    async fn scatter_bytes(
        &self,
        bytes_out: Option<Vec<Bytes>>,
        sid: StreamId,
    ) -> Result<Bytes, NetError> {
        let own_id = self.rank();

        if let Some(bytes_out) = bytes_out {
            if !self.is_root() {
                return Err(NetError::BadInput {
                    err: "scatter_bytes called with frames when not root",
                });
            }
            if bytes_out.len() != self.nprocs() {
                return Err(NetError::BadInput {
                    err: "scatter_bytes: one frame per rank required",
                });
            }

            for id in (0..self.nprocs()).filter(|p| *p != own_id as usize) {
                self.send_to(id as u32, bytes_out[id].clone(), sid).await?;
            }

            Ok(bytes_out[own_id as usize].clone())
        } else {
            if self.is_root() {
                return Err(NetError::BadInput {
                    err: "scatter_bytes called with no frames when root",
                });
            }

            self.recv_from(0, sid).await
        }
    }

    /// Every rank sends a frame to every other rank and receives one back,
    /// in rank order. The frame addressed to self passes through untouched.
    async fn alltoall_bytes(
        &self,
        bytes_out: Vec<Bytes>,
        sid: StreamId,
    ) -> Result<Vec<Bytes>, NetError> {
        let own_id = self.rank();
        let n = self.nprocs();
        if bytes_out.len() != n {
            return Err(NetError::BadInput {
                err: "alltoall_bytes: one frame per rank required",
            });
        }
        let mine = bytes_out[own_id as usize].clone();

        let send = async {
            for id in 0..n as u32 {
                if id == own_id {
                    continue;
                }
                self.send_to(id, bytes_out[id as usize].clone(), sid).await?;
            }
            Ok::<_, NetError>(())
        };
        let recv = async {
            let mut r = FuturesOrdered::new();
            for id in 0..n as u32 {
                let mine = mine.clone();
                r.push_back(Box::pin(async move {
                    if id == own_id {
                        Ok::<_, NetError>(mine)
                    } else {
                        self.recv_from(id, sid).await
                    }
                }));
            }
            r.try_collect::<Vec<_>>().await
        };

        let (_, frames) = futures::try_join!(send, recv)?;
        Ok(frames)
    }

    /// Everyone sends a frame to the root, which runs a computation over the
    /// gathered frames and redistributes the result.
    async fn root_compute_bytes(
        &self,
        bytes: &[u8],
        sid: StreamId,
        f: impl Fn(Vec<Bytes>) -> Vec<Bytes> + Send,
    ) -> Result<Bytes, NetError> {
        let root_response = self.gather_bytes(bytes, sid).await?.map(f);
        self.scatter_bytes(root_response, sid).await
    }
}

/// Tear the whole process group down after a fault detected inside a
/// collective, so no peer is left blocked. Exit code 2 distinguishes the
/// abort path from ordinary command failures.
pub fn abort_group(reason: &str) -> ! {
    eprintln!("collective abort: {}", reason);
    std::process::exit(2)
}

/// Print only on the root rank.
pub fn println_zero<N: ProcessGroup>(net: &N, msg: impl AsRef<str>) {
    if net.is_root() {
        println!("{}", msg.as_ref());
    }
}

/// Print only on the root rank, without a trailing newline.
pub fn print_zero<N: ProcessGroup>(net: &N, msg: impl AsRef<str>) {
    if net.is_root() {
        print!("{}", msg.as_ref());
    }
}
