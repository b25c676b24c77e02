//! Herdwatch - GPS and activity telemetry for livestock.
//!
//! # Overview
//!
//! Collar trackers report position, accelerometer activity, body temperature
//! and battery level. Herdwatch attributes each reading to the animal wearing
//! the device, classifies its behavior, stores it as a time series and raises
//! alerts when something looks wrong. Alerts move through an explicit
//! lifecycle: triggered, acknowledged, resolved.
//!
//! # Modules
//!
//! - [`model`]: Animals, readings, alerts and the request/response types
//! - [`error`]: The error taxonomy and its HTTP mapping
//! - [`config`]: Environment-driven configuration
//! - [`storage`]: SQLite storage layer
//! - [`registry`]: Device to animal resolution
//! - [`telemetry`]: Latest positions and history
//! - [`rules`]: Alert rules evaluated on each reading
//! - [`alerts`]: Alert engine and lifecycle
//! - [`ingest`]: Ingestion pipeline
//! - [`worker`]: Periodic device-silence sweep
//! - [`api`]: HTTP API handlers

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod registry;
pub mod rules;
pub mod storage;
pub mod telemetry;
pub mod worker;
