//! Progress fan-out to watchers.

mod emitter;

pub use emitter::{Emitter, LiveEntry, WatchOptions};
