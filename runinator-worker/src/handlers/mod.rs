//! Built-in handler implementations.

pub mod console;
