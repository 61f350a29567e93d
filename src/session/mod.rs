//! Recording session orchestration
//!
//! `SessionController` drives the capture lifecycle, forwards finalized
//! chunks into the upload pipeline, and triggers remote analysis when a
//! session completes.

mod controller;
mod stats;

pub use controller::SessionController;
pub use stats::SessionStats;
