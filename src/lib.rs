pub mod allocator;
pub mod backfill;
pub mod config;
pub mod decoder;
pub mod gateway;
pub mod ledger;
pub mod output;
pub mod scheduler;
pub mod server;
