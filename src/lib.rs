pub mod config;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod ingest;
pub mod links;
pub mod page;
pub mod pool;
pub mod range;
pub mod server;
pub mod store;
pub mod trace;
pub mod translator;
