pub mod config;
pub mod model;
pub mod refresh_set;
pub mod refresher;
pub mod runtime;
pub mod session;
pub mod source;
pub mod staleness;
pub mod store;
pub mod timestamp;
