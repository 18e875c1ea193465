//! Authenticated REST access and the HTTP token refresher.

pub mod client;

pub use client::{Client, HttpTokenRefresher};
