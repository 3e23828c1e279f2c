//! ferritin-examples
//!
//! Runnable examples for the ferritin crates.
//!
//! ```shell
//! cargo run --example dti -- --cpu
//! ```
