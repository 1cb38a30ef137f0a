//! Pipeline observer service: configuration and HTTP API

pub mod api;
pub mod config;
