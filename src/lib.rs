//! Adaptive rate limiting and attack detection engine.
//!
//! The crate protects authentication and API endpoints from brute force,
//! volumetric, distributed, and application-layer abuse. The engine lives in
//! [`core`]; [`api`] is the HTTP boundary that invokes it.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
