//! Shared test utilities for mediaforge integration tests.
//!
//! - `TestHarness`: temp storage root, input directory and a config wired to
//!   fake converter binaries
//! - `fakes`: the shell scripts standing in for ffmpeg, ffprobe, soffice
//!   and pdftoppm

pub mod fakes;
pub mod harness;

pub use harness::{wait_for, TestHarness};
