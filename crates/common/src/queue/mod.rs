//! Bounded backpressure queue
//!
//! Admission is a non-blocking counter check against `max_queue_size +
//! max_concurrent`; admitted tasks wait in a FIFO channel for one of
//! `max_concurrent` workers. The submitter gets a [`TaskHandle`] that resolves
//! to the task's own result.
//!
//! ```no_run
//! use fetchguard_common::error::FetchError;
//! use fetchguard_common::queue::{BackpressureQueue, QueueConfig, ShutdownMode};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = BackpressureQueue::new(QueueConfig::default())?;
//!
//! let handle = queue.submit(|| async { Ok::<_, FetchError>(42) })?;
//! assert_eq!(handle.await?, 42);
//!
//! queue.shutdown(ShutdownMode::Drain).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod core;

pub use self::config::{QueueConfig, QueueConfigBuilder};
pub use self::core::{BackpressureQueue, QueueMetrics, ShutdownMode, TaskHandle};
