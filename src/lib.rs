//! # Gridwise - price-driven battery dispatch for solar plants
//!
//! Gridwise watches wholesale electricity prices and a home battery plant,
//! and decides every five minutes whether the battery should hold its
//! energy for the night, export excess solar, or dispatch into the grid at
//! a good feed-in price.
//!
//! ## Architecture
//!
//! - `config`: YAML configuration with defaults and validation
//! - `logging`: Tracing setup and structured component loggers
//! - `profile`: Daily cumulative-load profiles from sensor history
//! - `forecast`: Consumption forecasts over time-of-day windows
//! - `base_load`: Percentile base load estimate and solar daytime
//! - `pricing`: Price feed abstraction and the Amber Electric client
//! - `plant`: Plant abstraction over Home Assistant entities
//! - `home_assistant`: Home Assistant REST client
//! - `dispatch`: Working modes, decision rules and the dispatch engine
//! - `notify`: Notifications and published sensors
//! - `controller`: The main loop tying everything together

pub mod base_load;
pub mod cache;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod forecast;
pub mod home_assistant;
pub mod logging;
pub mod notify;
pub mod plant;
pub mod pricing;
pub mod profile;

// Re-export commonly used types
pub use config::Config;
pub use controller::Controller;
pub use error::{GridwiseError, Result};
