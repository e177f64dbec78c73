//! Tableflow - metadata-driven table ingestion orchestrator
//!
//! A control table (`table_config`) lists the source tables to ingest. Each
//! run copies every active table, in priority order and with bounded
//! concurrency, either as a full reload or incrementally past a stored
//! watermark, and records the outcome in the execution logs.

pub mod admin_graphql;
pub mod admin_mutations;
pub mod connector;
pub mod coordinator;
pub mod copy;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod registry;
pub mod registry_sync;
pub mod settings;
pub mod storage;
pub mod watermark;
pub mod web;
