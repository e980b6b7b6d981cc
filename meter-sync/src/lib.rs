//! Mirrors remote metering hardware into a local device model.
//!
//! Two independent producers feed each device's [`sink::CapabilityStateSink`]:
//! a periodic pull path ([`scheduler`] over [`api`], folded by [`aggregator`])
//! and a push path ([`session`] over [`transport`], through [`normalize`] and
//! [`mapping`]). [`device::Device`] owns both and tears them down together.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod device;
pub mod errors;
pub mod mapping;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod transport;
pub mod validate;
