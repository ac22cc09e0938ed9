//! Focusgate - block distracting sites during focus sessions.
//!
//! This crate provides the command line front end. The proxy engine and
//! session control live in `focusgate-proxy`.

pub mod cli;

pub use cli::Args;
