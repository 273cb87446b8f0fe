#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod accumulator;
pub mod api;
pub mod config;
pub mod constants;
pub mod extract;
pub mod logging;
pub mod panel;
pub mod redaction;
pub mod reveal;
pub mod session;
pub mod settings;
pub mod sse;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod view;

pub use types::*;

pub use config::Args;
