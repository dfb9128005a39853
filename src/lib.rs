pub mod config;
pub mod error;
pub mod features;
mod ffi;
mod router;
pub mod state;
pub mod ui;

#[cfg(test)]
mod ui_tests;

pub use ffi::{signdesk_dispatch, signdesk_free_string};
pub use router::{dispatch, install_rasterizer};
