//! # netcore-exec
//!
//! Executors for netcore. Every executor implements
//! `netcore_core::Executor` and can be handed to a `Manager` as
//! `Arc<dyn Executor>`.
//!
//! | Executor         | Threads                  | `max_concurrency_level` |
//! |------------------|--------------------------|-------------------------|
//! | `InlineExecutor` | caller                   | 1                       |
//! | `ManualExecutor` | whoever pumps it         | configurable            |
//! | `ThreadExecutor` | one per submission burst | 1                       |
//! | `WorkerThread`   | one dedicated            | 1                       |
//! | `ThreadPool`     | N, lazily (re)spawned    | N                       |
//!
//! Shutdown is idempotent everywhere: queued tasks are dropped without
//! running, their count is returned, and owned threads are joined (never
//! the calling thread).

pub mod semaphore;
pub mod idle;
pub mod inline;
pub mod manual;
pub mod thread;
pub mod worker_thread;
pub mod thread_pool;
pub mod config;

mod worker;

pub use semaphore::Semaphore;
pub use idle::IdleWorkerSet;
pub use inline::InlineExecutor;
pub use manual::ManualExecutor;
pub use thread::ThreadExecutor;
pub use worker_thread::WorkerThread;
pub use thread_pool::ThreadPool;
pub use config::PoolConfig;
