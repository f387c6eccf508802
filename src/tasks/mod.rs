pub mod queue_flusher;

pub use queue_flusher::{DEFAULT_FLUSH_INTERVAL, QueueFlusher};
