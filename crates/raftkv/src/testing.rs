//! In-process cluster harness: a simulated network with partitions and
//! helpers for waiting on elections and replication.

mod network;
mod router;
mod utils;

pub use network::*;
pub use router::*;
pub use utils::*;
