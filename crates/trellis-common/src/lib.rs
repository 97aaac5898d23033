//! Shared types for the Trellis overlay router.
//!
//! This crate contains:
//! - **Wire types** — telemetry reports and route directives exchanged
//!   between agents and the controller over HTTP
//! - **Subnet math** — tunnel subnet parsing and membership checks
//! - **Health model** — component health states and worst-of aggregation
//! - **Metrics rendering** — Prometheus text exposition of peer metrics

pub mod health;
pub mod metrics;
pub mod net;
pub mod routes;
pub mod telemetry;
