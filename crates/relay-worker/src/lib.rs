//! Hosted worker pool.
//!
//! Out-of-process workers that claim leased runs from the queue, execute
//! them against the agent runtime, renew their leases, and settle results.
//! Polling `claim_next` is the correctness floor; the server's SSE push is
//! an optimization layered on top for workers that maintain a stream.

pub mod config;
pub mod pool;
pub mod runtime;
pub mod worker;

pub use config::WorkerConfig;
pub use pool::WorkerPool;
pub use runtime::HttpAgentRuntime;
pub use worker::HostedWorker;
