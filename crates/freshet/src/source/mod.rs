//! Change feed access.

mod memory;
mod reader;
mod storage_feed;
mod traits;

pub use memory::MemoryFeed;
pub use reader::{ReaderStats, SourceReader};
pub use storage_feed::StorageFeed;
pub use traits::{ChangeFeed, ChangeStream};
