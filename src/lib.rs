pub mod agent;
pub mod aggregator;
pub mod api;
pub mod clock;
pub mod config;
pub mod export;
pub mod ledger;
pub mod scheduler;
pub mod stream;
