// cachetable - concurrent page cache core for a fractal-tree storage engine

pub mod cachefile;
pub mod cachetable;
pub mod checkpoint;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod evictor;
pub mod pair;
pub mod pair_list;
pub mod status;
pub mod sync;
pub mod worker_pool;

pub use cachefile::{Cachefile, CachefileCallbacks};
pub use cachetable::{CacheTable, LockType, PinOutcome, Unlocker};
pub use config::CacheTableConfig;
pub use error::{CacheError, Result};
pub use pair::attr::PairAttr;
pub use pair::callbacks::{FetchCallback, FlushContext, PairValue};
pub use pair::Pair;
pub use status::{Counter, StatusSink};
