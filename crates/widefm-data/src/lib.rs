//! Data pipeline for WideFM.
//!
//! Training data flows through three stages before any gradient is computed:
//!
//! 1. A partitioned, chunked [`reader`] streams a byte range of a libfm URI
//!    and parses it into CSR [`RowBlock`]s.
//! 2. The [`localizer`] compacts each block's 64-bit feature IDs into a
//!    sorted unique key list and rewrites the column indices to positions
//!    into it, optionally counting feature appearances.
//! 3. For the batched optimizers, the [`tile`] builder persists localized
//!    blocks augmented with a column map, so every epoch after the first
//!    reads from the tile store instead of re-parsing text.
//!
//! # Example
//!
//! ```
//! use widefm_data::rowblock::RowBlockBuilder;
//! use widefm_data::localizer::localize;
//!
//! let mut b = RowBlockBuilder::new();
//! b.push_row(1.0, 1.0, &[(0, 100, 1.0), (0, 7, 1.0)]);
//! b.push_row(-1.0, 1.0, &[(0, 7, 2.0)]);
//! let block = b.finish();
//!
//! let local = localize(&block, true);
//! assert_eq!(&*local.feaids, &[7, 100]);
//! assert_eq!(&*local.data.index, &[1, 0, 0]);
//! ```

mod error;
pub mod libfm;
pub mod localizer;
pub mod reader;
pub mod rowblock;
pub mod tile;

pub use error::{DataError, Result};
pub use localizer::{localize, Localized};
pub use reader::{BatchReader, ChunkReader, ReaderConfig};
pub use rowblock::{RowBlock, RowBlockBuilder};
pub use tile::{Tile, TileBuilder, TileStore};
