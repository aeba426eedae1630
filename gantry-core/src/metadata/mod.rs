//! Key-value metadata used for cluster coordination.
//!
//! Keys are `/`-separated paths such as `/cluster/register/broker-1`. Values are JSON.

mod errors;
pub use errors::{MetadataError, Result};

mod store;
pub use store::{KeyValueVersion, MetadataStore};

mod watch;
pub use watch::{WatchEvent, WatchStream};

mod memory_store;
pub use memory_store::MemoryStore;
