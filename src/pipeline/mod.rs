pub mod dispatcher;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod worker;


pub use dispatcher::{DispatchSettings, DispatchSummary, Dispatcher};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use progress::ApplyProgress;
pub use queue::{ChangeQueue, QueueRegistry};
pub use worker::{ApplyWorker, BatchApplier, FailurePolicy, WorkerReport};
