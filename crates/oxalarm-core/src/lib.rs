//! Alarm state engine for streamed metric samples.
//!
//! Samples are buffered per (entity, metric) in a [`window::SampleWindow`],
//! evaluated against every attached [`strategy::Strategy`] by the pure
//! [`evaluator`], and the resulting verdicts drive a debounced per-key state
//! machine ([`dfa`]) whose transitions are emitted as
//! [`oxalarm_common::types::AlarmEvent`]s through an [`dispatch::AlarmSink`].
//!
//! [`router::AlarmRouter`] partitions series across worker shards so each
//! key has a single writer, and [`rules::RuleBook`] swaps rule snapshots
//! atomically on reload.

pub mod dfa;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod router;
pub mod rules;
pub mod state;
pub mod stats;
pub mod strategy;
pub mod window;


pub use dispatch::AlarmSink;
pub use engine::{AlarmEngine, EngineConfig};
pub use error::{AlarmError, Result};
pub use evaluator::Verdict;
pub use router::{AlarmRouter, RouterConfig};
pub use rules::{RuleBook, RuleSet, RuleSource, StaticRules};
pub use state::{AlarmState, AlarmStatus, StateStore};
pub use strategy::Strategy;
