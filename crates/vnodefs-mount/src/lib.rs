//! Shared utilities for vnodefs volumes.
//!
//! These pieces do not depend on the directory graph and are usable by any
//! frontend that serves a vnodefs volume.
//!
//! # Components
//!
//! - [`HandleTable`] - Thread-safe cookie table with auto-incrementing ids
//! - [`io_error_to_errno`] - Map `std::io::Error` onto a POSIX errno
//! - [`VolumeStats`] - Lock-free counters for graph, lock and backend activity
//!
//! # Example
//!
//! ```
//! use vnodefs_mount::{HandleTable, VolumeStats};
//!
//! let cookies: HandleTable<String> = HandleTable::new_auto_id();
//! let id = cookies.insert_auto("dir cookie".to_string());
//! assert_eq!(id, 1);
//!
//! let stats = VolumeStats::new();
//! stats.record_lookup();
//! assert_eq!(stats.snapshot().lookups, 1);
//! ```

mod errno;
mod handle_table;
pub mod stats;

pub use errno::io_error_to_errno;
pub use handle_table::HandleTable;
pub use stats::{VolumeStats, VolumeStatsSnapshot};
