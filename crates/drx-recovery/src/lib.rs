//! DRX Recovery - four-level DR escalation
//!
//! - [`DrController`]: opens, escalates, drives and resolves incidents
//! - [`HealthMonitor`]: turns unhealthy primary health checks into triggers

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod controller;
pub mod monitor;
mod procedures;

pub use controller::DrController;
pub use monitor::HealthMonitor;
