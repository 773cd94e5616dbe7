//! Health guard service wiring: configuration and the probe/metrics API

pub mod api;
pub mod config;
