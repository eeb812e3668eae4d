//! An async pool of lazily created, shareable resources.
//!
//! # Features
//!
//! - Resources (connections, workers, heavy objects) are created only when a
//!   caller needs one, never ahead of time.
//! - Configurable maximum and minimum number of resources, and how many
//!   callers may share one resource at once.
//! - Idle resources above the minimum are evicted, immediately or after an
//!   idle timeout. Reusing a resource cancels its pending eviction.
//! - Callers that find the pool saturated wait in line and are served in
//!   arrival order. A returned resource goes to the next caller in line
//!   before it is considered for eviction.
//! - [`Pool::destroy`] waits for borrowed resources to come back, tears
//!   every resource down and fails the callers still in line.
//!
//! # Examples
//!
//! ## Borrow with a closure
//!
//! ```rust
//! use lazy_pool::Pool;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = Pool::builder(|| async { Ok::<_, std::io::Error>(vec![0u8; 16]) })
//!     .max_instances(4)
//!     .idle_timeout(Duration::from_secs(10))
//!     .build();
//!
//! let len = pool.run(|buf| Box::pin(async move { buf.len() })).await.unwrap();
//! assert_eq!(len, 16);
//! assert_eq!(pool.size(), 1);
//!
//! pool.destroy().await;
//! assert_eq!(pool.size(), 0);
//! # }
//! ```
//!
//! ## Borrow with a guard
//!
//! ```rust
//! use lazy_pool::Pool;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = Pool::builder(|| async { Ok::<_, std::io::Error>(String::from("shared")) })
//!     .max_instances(1)
//!     .concurrency_per_instance(2)
//!     .build();
//!
//! let first = pool.pull().await.unwrap();
//! let second = pool.pull().await.unwrap();
//! assert_eq!(pool.size(), 1);
//! assert_eq!(*first, *second);
//! drop(first);
//! second.release().await;
//! assert_eq!(pool.size(), 0);
//! # }
//! ```

mod builder;
mod entry;
mod error;
mod instance;
mod machine;
mod pool;

pub use builder::Builder;
pub use entry::Entry;
pub use error::{BoxError, PoolError};
pub use pool::{Config, Pool, PoolState, Status};
