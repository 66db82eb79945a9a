pub mod array;
pub mod buffer;
pub mod ops;
pub mod pack;
pub mod shape;

pub use array::{block_distribution, copy_patch, DistributedArray};
pub use buffer::{ArrayBuffer, Element};
pub use ops::{reduce_sum, BinaryOp, ReduceOp};
pub use pack::{enumerate, pack, pack_into_new, partial_sum, unpack1d};
