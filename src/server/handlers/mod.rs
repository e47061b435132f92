//! Route handler modules for the haven REST API.

pub mod emergency;
pub mod health;
pub mod websocket;
