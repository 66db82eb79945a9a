pub mod commands;
pub mod memory;
pub mod reader;
pub mod store;
pub mod writer;

pub use commands::{binary_combine, open_inputs, record_reduce, subset};
pub use memory::MemoryStore;
pub use reader::CdfDataset;
pub use store::{num_groups, CompletedRead, Hints, RequestId, VaraFile, VaraStore};
pub use writer::{FileWriter, WriterOptions};
