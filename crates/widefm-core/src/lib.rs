//! Core types shared by every WideFM crate.
//!
//! WideFM trains sparse factorization-machine models whose feature-ID space
//! is 64 bits wide. This crate holds the small vocabulary the rest of the
//! system is written in:
//!
//! - [`feaid`] - the 64-bit feature-ID codec (byte reversal for balanced
//!   range sharding, feature-group packing)
//! - [`node`] - node-ID encoding for the scheduler/server/worker groups
//! - [`sarray`] - [`SArray`], a reference-counted typed buffer that is the
//!   transport unit for every push/pull payload
//! - [`progress`] - the fixed-layout training progress record merged across
//!   workers by componentwise addition
//! - [`kwargs`] - key=value configuration with consume-and-return-remainder
//!   semantics
//! - [`role`] - process role discovery, read once at start-up
//!
//! # Example
//!
//! ```
//! use widefm_core::feaid::{encode_group, decode_group, reverse_bytes};
//!
//! let id = encode_group(991, 3, 2).unwrap();
//! assert_eq!(decode_group(id, 2), 3);
//! assert_eq!(reverse_bytes(reverse_bytes(id)), id);
//! ```

mod error;
pub mod feaid;
pub mod kwargs;
pub mod node;
pub mod progress;
pub mod role;
pub mod sarray;

pub use error::{CoreError, Result};
pub use feaid::FeaId;
pub use kwargs::KwArgs;
pub use progress::Progress;
pub use role::Role;
pub use sarray::SArray;

/// Default number of threads for block-level data parallelism.
pub const DEFAULT_NTHREADS: usize = 2;

/// Returns a short debug string of a numeric slice, eliding the middle.
///
/// Prints `[n]: v0 v1 ... v{n-1}`, showing at most `m` leading and trailing
/// elements. Used in trace logs when inspecting pulled weights or gradients.
pub fn debug_str<T: std::fmt::Display>(data: &[T], m: usize) -> String {
    use std::fmt::Write;
    let n = data.len();
    let mut s = format!("[{}]: ", n);
    if n <= 2 * m {
        for v in data {
            let _ = write!(s, "{} ", v);
        }
    } else {
        for v in &data[..m] {
            let _ = write!(s, "{} ", v);
        }
        s.push_str("... ");
        for v in &data[n - m..] {
            let _ = write!(s, "{} ", v);
        }
    }
    s
}
