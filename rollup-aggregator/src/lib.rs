//! In-memory metrics aggregation.
//!
//! The aggregator receives a continuous stream of metric samples, each tagged with a set of
//! aggregation [`Policy`]s. For every metric id and policy it keeps rolling per-window aggregates,
//! and periodically flushes completed windows to a downstream [`Writer`].
//!
//! # Architecture
//!
//! ```text
//! decoder -> PacketQueue -> workers -> MetricMap -> Entry -> MetricLists -> MetricElem
//!                                                                 ^
//!                                             FlushManager -------+--> Writer
//! ```
//!
//!  - The [`PacketQueue`] buffers decoded [`Packet`]s and drops them when full.
//!  - The [`MetricMap`] holds one [`Entry`] per metric id. An entry reconciles the policies of
//!    every sample with its current state and forwards the value to one [`MetricElem`] per
//!    policy. Elements of removed policies are tombstoned and flush their remaining windows.
//!  - Elements live in [`MetricList`]s, one per resolution, which consume eligible windows when
//!    flushed.
//!  - The [`FlushManager`] decides when lists flush. Among several aggregator instances receiving
//!    the same traffic, the leader writes the aggregates while followers discard them.
//!
//! # Windows
//!
//! A sample received at time `t` is added to the window starting at `t` truncated to the policy's
//! resolution. A window starting at `s` becomes eligible for flushing once the flush cutoff passes
//! `s + resolution`. The leader uses `now - allowed_lateness` as cutoff.
//!
//! # Setup
//!
//! A process reads a [`RollupConfig`], calls [`init`] once to set up logging and internal statsd
//! metrics, and creates the aggregator from [`RollupConfig::options`].
//!
//! # Example
//!
//! ```
//! use rollup_aggregator::{Aggregator, MetricUnion, Options, VersionedPolicies};
//!
//! let aggregator = Aggregator::new(Options::default());
//! let policies = VersionedPolicies::new(1, 0, vec!["10s:2d".parse().unwrap()]);
//!
//! aggregator
//!     .add_metric_with_policies(MetricUnion::counter("requests", 1), &policies)
//!     .unwrap();
//!
//! assert_eq!(aggregator.map().len(), 1);
//! ```

#![warn(missing_docs)]

mod aggregation;
mod config;
mod elem;
mod entry;
mod flush;
mod list;
mod map;
mod metric;
mod policy;
mod pool;
mod queue;
mod service;
mod setup;
mod statsd;
mod time;
mod writer;

pub use self::aggregation::*;
pub use self::config::*;
pub use self::elem::*;
pub use self::entry::*;
pub use self::flush::*;
pub use self::list::*;
pub use self::map::*;
pub use self::metric::*;
pub use self::policy::*;
pub use self::pool::*;
pub use self::queue::*;
pub use self::service::*;
pub use self::setup::*;
pub use self::time::*;
pub use self::writer::*;
