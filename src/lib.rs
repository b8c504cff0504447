//! Orchestration core for a multi-provider LLM request router: candidate
//! resolution, retryable execution, per-channel request transforms,
//! performance/health tracking, and unary/streaming response delivery.
//!
//! HTTP ingress (`server`) is a thin binding layer; everything that decides
//! *which* channel handles a request and *how* it gets there lives in
//! `orchestrator` and the modules it composes.

pub mod balance;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod overrides;
pub mod perf;
pub mod persist;
pub mod policy;
pub mod registry;
pub mod select;
pub mod server;
pub mod state;
pub mod storage;
