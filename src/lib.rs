pub mod app_config;
pub mod domain;
pub mod event_log;
pub mod metrics;
pub mod payment;
pub mod store;
pub mod utils;
