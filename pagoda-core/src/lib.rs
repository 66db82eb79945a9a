pub mod agg;
pub mod dataset;
pub mod grid;
pub mod mask;
pub mod select;
pub mod slab;

pub use agg::{AggregationJoinExisting, AggregationUnion};
pub use dataset::{Attribute, Dataset, Dimension, ReadHandle, Variable};
pub use grid::{Grid, GridKind};
pub use mask::{Mask, MaskMap};
pub use select::{append_history, select_variables, CommandOptions};
pub use slab::{parse_slab, CoordHyperslab, IndexHyperslab, LatLonBox, Slab};
