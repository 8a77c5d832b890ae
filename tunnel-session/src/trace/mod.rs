//! Session tracing: structured lifecycle events and the sinks that receive them

mod event;
mod sink;

pub use event::SessionEvent;
pub use sink::{MemoryTraceSink, TraceSeq, TraceSink, TracingSink};
