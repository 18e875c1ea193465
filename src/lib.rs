pub mod assignment;
pub mod auth;
pub mod config;
pub mod error;
pub mod rest;
pub mod types;
pub mod websocket;
pub use config::RealtimeConfig;
pub use error::{AuthError, RealtimeError, Result};
