// src/core/health/mod.rs

//! Per-backend health checking: one long-running worker per backend slot,
//! feeding the failover engine through the shared request queue.

pub mod worker;

pub use worker::HealthCheckWorker;
