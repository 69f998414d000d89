//! Email threading module
//!
//! Threads are built incrementally as messages arrive:
//!
//! 1. **Resolution** (`resolver`): a message joins the thread of the first
//!    stored message named by its `In-Reply-To` or `References` headers, or
//!    starts a new thread. Replies that arrived before their parent are
//!    adopted when the parent shows up, merging the two threads.
//! 2. **Ordering** (`ordering`): `thread_depth` and `thread_order` are derived
//!    from the parent links by a depth-first traversal. Live ingestion
//!    recomputes the touched thread immediately; bulk imports defer it.
//!
//! Every thread keeps exactly one root and acyclic parent links; deletion
//! (`deletion`) repairs the tree when a message disappears.

pub mod cycle_detection;
pub mod deletion;
pub mod ordering;
pub mod resolver;

pub use ordering::{compute_thread_positions, recompute_thread, recompute_threads};
pub use resolver::{adopt_orphans, merge_threads, place, Placement};
