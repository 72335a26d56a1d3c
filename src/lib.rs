pub mod accuracy;
pub mod analysis;
pub mod client;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod forecast;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod schema;
pub mod validation;
