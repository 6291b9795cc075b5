//! kinetic-core: request scheduling and batching for a Kinetic drive.
//!
//! Commands from many connections are admitted, ordered by a
//! deadline-aware priority queue, optionally grouped into atomic batches,
//! executed through collaborator traits and answered, all with bounded
//! memory and bounded queues.
//!
//! The entry point is [`Pipeline`]: register connections with a
//! [`CommandSource`] and [`ResponseSink`], call
//! [`Pipeline::notify_readable`] when input arrives, and the pipeline's
//! ingest, execute and response threads take it from there.

pub mod aging;
pub mod batch;
pub mod collab;
pub mod command;
pub mod connection;
pub mod error;
pub mod events;
pub mod latency;
pub mod limits;
pub mod memory;
pub mod pipeline;
pub mod priority;
pub mod queue;
pub mod response_queue;
pub mod status;
pub mod time;

pub use aging::{AgingConfig, AgingTimer, TimerHandler};
pub use batch::{AtomicWrite, BatchKey, BatchRegistry, WriteOp};
pub use collab::{
    CommandProcessor, CommandSource, DriveLifecycle, NoopObserver, Outcome, PipelineObserver,
    ResponseSink, StorageWrite, Validator,
};
pub use command::{Command, IncomingCommand, OpKind, Synchronization};
pub use connection::{Connection, ConnectionState};
pub use error::{BatchError, PipelineError, PoolError, QueueError, SinkError, SourceError};
pub use latency::{LatencyEntry, LatencyLog, LatencyLogConfig};
pub use limits::Limits;
pub use memory::{PooledValue, ValuePool};
pub use pipeline::{Collaborators, Pipeline, PipelineConfig, StatsSnapshot};
pub use priority::Priority;
pub use queue::{DeadlinePriorityQueue, QueueConfig, Scheduled};
pub use response_queue::BoundedResponseQueue;
pub use status::{Response, Status, StatusCode};
