//! Configuration
//!
//! TOML file with `[capture]`, `[encoder]` and `[pipeline]` sections. Every
//! key is optional; command-line flags override what the file sets.

mod schema;
mod store;

pub use schema::*;
