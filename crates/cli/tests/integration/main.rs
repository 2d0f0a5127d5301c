//! CLI integration tests.

mod build_tests;
mod common;
mod gc_tests;
mod image_tests;
