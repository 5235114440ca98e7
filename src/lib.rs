//! Palisade: a stateful, in-process threat-detection and
//! request-governance engine for HTTP services.
//!
//! The engine accumulates per-client threat evidence across requests
//! (suspicion scores, blocks, rate buckets, fingerprints), inspects each
//! request against signature tables, and produces a single terminal
//! verdict per request. All state is in-memory and bounded by a periodic
//! janitor sweep.

pub mod admin;
pub mod audit;
pub mod clock;
pub mod config;
pub mod detectors;
pub mod governor;
pub mod ip;
pub mod janitor;
pub mod pipeline;
pub mod scoring;
pub mod server;
pub mod store;
