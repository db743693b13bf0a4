//! DRX Traffic - health-gated traffic shifting
//!
//! [`TrafficShiftController`] raises a candidate environment's share in fixed
//! steps while it stays healthy, reverts to the stable environment on the
//! first unhealthy poll, and performs whole-component failovers for the DR
//! controller.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod controller;

pub use controller::{PollOutcome, TrafficShiftController};
