//! HTTP request handlers.

pub mod frames;
pub mod health;
pub mod host;
