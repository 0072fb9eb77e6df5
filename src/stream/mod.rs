//! Live event fan-out and observer feeds.

pub mod feed;
pub mod multiplexer;

pub use feed::{Feed, FeedItem};
pub use multiplexer::{Closure, Multiplexer};
