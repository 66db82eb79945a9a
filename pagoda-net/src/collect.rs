use crate::{NetError, ProcessGroup, StreamId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio_util::bytes::Bytes;

/// An element the reduction collectives understand.
pub trait GopElem:
    Serialize + DeserializeOwned + Send + Sync + Copy + PartialOrd + std::ops::Add<Output = Self>
{
}

impl GopElem for i32 {}
impl GopElem for i64 {}
impl GopElem for u64 {}
impl GopElem for usize {}
impl GopElem for f32 {}
impl GopElem for f64 {}

fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, NetError> {
    bincode::deserialize(&bytes[..]).map_err(|e| NetError::Generic(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, NetError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| NetError::Generic(e.to_string()))
}

/// Typed collectives over the byte-level group primitives. Every method is
/// collective; each rank must reach the same calls in the same order.
#[async_trait]
pub trait Collectives: ProcessGroup {
    async fn gather_to_root<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        out: &T,
        sid: StreamId,
    ) -> Result<Option<Vec<T>>, NetError> {
        let bytes_out = encode(out)?;
        match self.gather_bytes(&bytes_out, sid).await? {
            Some(frames) => {
                debug_assert!(self.is_root());
                let mut ret = Vec::with_capacity(frames.len());
                for frame in frames {
                    ret.push(decode(&frame)?);
                }
                Ok(Some(ret))
            }
            None => Ok(None),
        }
    }

    async fn scatter_from_root<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        out: Option<Vec<T>>,
        sid: StreamId,
    ) -> Result<T, NetError> {
        let frames = match out {
            Some(values) => {
                let mut frames = Vec::with_capacity(values.len());
                for value in &values {
                    frames.push(encode(value)?);
                }
                Some(frames)
            }
            None => None,
        };
        let frame = self.scatter_bytes(frames, sid).await?;
        decode(&frame)
    }

    /// Everyone sends a value to the root, which runs `f` over the gathered
    /// values and redistributes the result.
    async fn root_compute<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        out: &T,
        sid: StreamId,
        f: impl Fn(Vec<T>) -> Vec<T> + Send,
    ) -> Result<T, NetError> {
        let gathered = self.gather_to_root(out, sid).await?;
        let response = gathered.map(f);
        self.scatter_from_root(response, sid).await
    }

    /// The root provides `Some(value)`; every rank returns the value.
    async fn broadcast<T: Serialize + DeserializeOwned + Send + Sync + Clone>(
        &self,
        out: Option<T>,
        sid: StreamId,
    ) -> Result<T, NetError> {
        if self.is_root() {
            let value = out.ok_or(NetError::BadInput {
                err: "broadcast: root must provide a value",
            })?;
            self.scatter_from_root(Some(vec![value; self.nprocs()]), sid)
                .await
        } else {
            self.scatter_from_root(None, sid).await
        }
    }

    async fn allgather<T: Serialize + DeserializeOwned + Send + Sync + Clone>(
        &self,
        out: &T,
        sid: StreamId,
    ) -> Result<Vec<T>, NetError> {
        let gathered = self.gather_to_root(out, sid).await?;
        self.broadcast(gathered, sid).await
    }

    /// One value addressed to every rank; returns the values addressed to us,
    /// in rank order.
    async fn alltoall<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        out: &[T],
        sid: StreamId,
    ) -> Result<Vec<T>, NetError> {
        let mut frames = Vec::with_capacity(out.len());
        for value in out {
            frames.push(encode(value)?);
        }
        let frames_in = self.alltoall_bytes(frames, sid).await?;
        let mut ret = Vec::with_capacity(frames_in.len());
        for frame in frames_in {
            ret.push(decode(&frame)?);
        }
        Ok(ret)
    }

    async fn barrier(&self, sid: StreamId) -> Result<(), NetError> {
        self.allgather(&0u8, sid).await?;
        Ok(())
    }

    /// Elementwise sum across ranks; every rank must pass the same length.
    async fn gop_sum<T: GopElem>(&self, values: Vec<T>, sid: StreamId) -> Result<Vec<T>, NetError> {
        self.gop(values, sid, |a, b| a + b).await
    }

    async fn gop_min<T: GopElem>(&self, values: Vec<T>, sid: StreamId) -> Result<Vec<T>, NetError> {
        self.gop(values, sid, |a, b| if b < a { b } else { a }).await
    }

    async fn gop_max<T: GopElem>(&self, values: Vec<T>, sid: StreamId) -> Result<Vec<T>, NetError> {
        self.gop(values, sid, |a, b| if b > a { b } else { a }).await
    }

    async fn gop<T: GopElem>(
        &self,
        values: Vec<T>,
        sid: StreamId,
        combine: impl Fn(T, T) -> T + Send + Sync,
    ) -> Result<Vec<T>, NetError> {
        let len = values.len();
        let all = self.allgather(&values, sid).await?;
        let mut acc = values;
        for (rank, contribution) in all.into_iter().enumerate() {
            if contribution.len() != len {
                return Err(NetError::Protocol {
                    err: "reduction length differs across ranks".to_string(),
                    rank: rank as u32,
                });
            }
            if rank as u32 == self.rank() {
                continue;
            }
            for (a, b) in acc.iter_mut().zip(contribution) {
                *a = combine(*a, b);
            }
        }
        Ok(acc)
    }

    /// Root-only filesystem probe, result broadcast to every rank.
    async fn file_exists(&self, path: &Path, sid: StreamId) -> Result<bool, NetError> {
        let probed = if self.is_root() {
            Some(path.exists())
        } else {
            None
        };
        self.broadcast(probed, sid).await
    }
}

impl<N: ProcessGroup> Collectives for N {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalProcessGroup;

    const NPROCS: usize = 4;

    #[tokio::test]
    async fn allgather_returns_rank_order() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                net.allgather(&(net.rank() * 10), StreamId::Control)
                    .await
                    .unwrap()
            })
            .await;
        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20, 30]);
        }
    }

    #[tokio::test]
    async fn gop_sum_and_extrema() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let mine = vec![net.rank() as i64, 1];
                let total = net.gop_sum(mine.clone(), StreamId::Control).await.unwrap();
                let lo = net.gop_min(mine.clone(), StreamId::Control).await.unwrap();
                let hi = net.gop_max(mine, StreamId::Control).await.unwrap();
                (total, lo, hi)
            })
            .await;
        for (total, lo, hi) in results {
            assert_eq!(total, vec![6, 4]);
            assert_eq!(lo, vec![0, 1]);
            assert_eq!(hi, vec![3, 1]);
        }
    }

    #[tokio::test]
    async fn alltoall_routes_frames() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let me = net.rank();
                let out: Vec<u32> = (0..NPROCS as u32).map(|dst| me * 100 + dst).collect();
                net.alltoall(&out, StreamId::Data).await.unwrap()
            })
            .await;
        for (me, received) in results.into_iter().enumerate() {
            let expected: Vec<u32> = (0..NPROCS as u32).map(|src| src * 100 + me as u32).collect();
            assert_eq!(received, expected);
        }
    }

    #[tokio::test]
    async fn broadcast_from_root() {
        let group = LocalProcessGroup::new_local_group(NPROCS).await.unwrap();
        let results = group
            .simulate_group_round((), |net, _| async move {
                let value = if net.is_root() {
                    Some("geodesic".to_string())
                } else {
                    None
                };
                net.broadcast(value, StreamId::Control).await.unwrap()
            })
            .await;
        assert!(results.iter().all(|v| v == "geodesic"));
    }
}
