//! Library integration tests driving managers and the patch pipeline
//! against in-memory images and a scripted command runner.

mod apt_tests;
mod common;
mod dotnet_tests;
mod pipeline_tests;
