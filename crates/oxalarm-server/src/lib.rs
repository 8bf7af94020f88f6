pub mod config;
pub mod ingest;
pub mod rule_builder;
pub mod sinks;
