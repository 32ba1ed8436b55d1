//! Hardware-independent core of the two-channel on-time monitor
//!
//! Tracks how long each of two current clamps reads above a configurable
//! floor, and keeps a cumulative total per channel in step with a remote
//! state store across reboots, disconnects, and operator resets.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! device and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod reconcile;
pub mod remote;
pub mod report;
pub mod sampler;
pub mod sensors;
pub mod status;
