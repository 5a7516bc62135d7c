//! Bulk push-notification dispatch.
//!
//! [`PushDispatcher`] splits an address list into provider-sized chunks, sends
//! them through a bounded worker pool with inline backoff, and hands chunks it
//! could not deliver to a background retry worker backed by a dead-letter store.
//! Addresses the provider reports as permanently invalid are retired through the
//! [`TokenStore`].

pub mod backoff;
pub mod chunk;
pub mod client;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod normalize;
pub mod retry_queue;
pub mod token_store;

pub use backoff::BackoffPolicy;
pub use chunk::{Chunk, ChunkFate, partition};
pub use client::{DeliveryClient, HttpDeliveryClient};
pub use dead_letter::{
    DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore, PgDeadLetterStore,
};
pub use dispatcher::{PushDispatcher, PushDispatcherBuilder};
pub use error::{DeliveryError, DispatchError};
pub use lifecycle::TokenLifecycleManager;
pub use metrics::{MetricsEmitter, MetricsSink, TracingMetricsSink};
pub use normalize::normalize;
pub use retry_queue::{RetryQueue, RetryQueueItem, RetryWorker};
pub use token_store::{NoopTokenStore, PgTokenStore, TokenStore};
