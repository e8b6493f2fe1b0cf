//! Market data ingestion: exchange stream, REST snapshots and the demo source

pub mod client;
pub mod demo;
pub mod models;
pub mod rest;

pub use client::{BinanceConnector, ConnectionState, MarketDataFeed, MessageStream, StreamConnector};
pub use demo::{DemoConnector, DemoMarket, RandomWalk};
pub use rest::{MarketDataSource, RestClient};
