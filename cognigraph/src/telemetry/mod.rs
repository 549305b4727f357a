//! Streaming and telemetry
//!
//! The [`Reporter`] turns scheduler callbacks into one ordered event sequence,
//! fanned out to the live [`EventStream`] and to the [`TraceRecord`] that is
//! persisted through a [`TraceStore`].

pub mod diff;
pub mod event;
pub mod reporter;
pub mod store;
pub mod stream;
pub mod trace;

pub use diff::{diff_traces, NodeChange, NodeDiff, TraceDiff};
pub use event::{EventKind, NodeResult, NodeStatus, StreamEvent};
pub use reporter::{GraphOutcome, Reporter};
pub use store::{FileTraceStore, MemoryTraceStore, TraceStore};
pub use stream::EventStream;
pub use trace::{TraceAnnotation, TraceOutcome, TraceRecord};
