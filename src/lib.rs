//! An at-least-once background job queue with pluggable storage backends.
//!
//! # Features
//!
//! - **Pluggable Backends**: in-memory for tests, Redis (Lua-scripted
//!   atomic reservations) and MySQL (transactional row reservation) for
//!   production
//! - **Delayed Execution**: dispatch now, or at a duration/instant in the
//!   future
//! - **Retry Control**: per-task attempt caps, retry backoff and timeout
//!   budgets
//! - **Worker Pool**: dedicated pollers per queue, cooperative per-job
//!   timeouts, panic containment
//! - **Autoscaling**: backlog- and memory-aware worker pool resizing
//! - **Graceful Shutdown**: deadline-bounded quiescence
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskq::{Config, Driver, Queue, RawBody, Result, Task};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Email {
//!     to: String,
//!     subject: String,
//! }
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Task for SendEmail {
//!     fn name(&self) -> &str {
//!         "send_email"
//!     }
//!
//!     fn max_tries(&self) -> i64 {
//!         3
//!     }
//!
//!     fn retry_interval(&self) -> i64 {
//!         5
//!     }
//!
//!     async fn execute(&self, _ctx: CancellationToken, body: RawBody) -> Result<()> {
//!         let email: Email = body.unmarshal()?;
//!         println!("Sending email to: {}", email.to);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let queue = Queue::new(Driver::Memory, Config::default());
//!
//!     let task = Arc::new(SendEmail);
//!     queue.bootstrap_one(task.clone())?;
//!
//!     queue
//!         .dispatch(
//!             task.as_ref(),
//!             &Email {
//!                 to: "user@example.com".to_string(),
//!                 subject: "Welcome".to_string(),
//!             },
//!         )
//!         .await?;
//!
//!     queue.start()?;
//!
//!     // ... run until it is time to stop ...
//!     queue.shut_down(Duration::from_secs(30)).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
mod manager;
pub mod payload;
pub mod queue_client;
pub mod stats;
pub mod task;

pub use config::Config;
pub use driver::{Job, QueueDriver};
pub use error::{QueueError, Result};
pub use payload::{Payload, RawBody};
pub use queue_client::{Driver, Queue};
pub use stats::{JobStatistics, MemoryStatistics, Statistics, WorkerStatistics};
pub use task::{DEFAULT_MAX_EXECUTE_DURATION, FailedJobHandler, Task};
