//! Library exports for the newsletter dispatch service
//!
//! This module exposes internal components for testing and potential library usage.

pub mod chunk;
pub mod config;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod middleware;
pub mod model;
pub mod recipients;
pub mod route;
pub mod sending;
pub mod tracking;
pub mod transport;
