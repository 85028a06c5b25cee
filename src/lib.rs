#![recursion_limit = "256"]

#[macro_use]
extern crate chan;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
extern crate regex;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate slog;
#[cfg(test)]
extern crate slog_term;
extern crate time;

pub mod db;
pub mod domain;
pub mod error_helpers;
pub mod errors;
pub mod mediators;
pub mod model;
pub mod scheduler;
pub mod time_helpers;

// Mirrors the schema owned by the external bootstrap tool: skip rustfmt
#[cfg_attr(rustfmt, rustfmt_skip)]
pub mod schema;

#[cfg(test)]
mod test_helpers;
