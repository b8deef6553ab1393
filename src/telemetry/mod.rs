// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! Initialize tracing once at host startup:
//!
//! ```rust,ignore
//! use memsearch::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Operation latencies are recorded into [`metrics::GLOBAL_METRICS`] when the
//! `telemetry` cargo feature is enabled.

pub mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig};
pub use metrics::{Metrics, MetricsSnapshot, OperationMetrics};

#[cfg(feature = "telemetry")]
pub use metrics::GLOBAL_METRICS;
