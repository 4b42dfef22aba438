//! # arbmon
//!
//! Read-only multi-chain DEX arbitrage monitor. Ingests EVM block traffic
//! and pool reserves in real time, classifies multi-hop arbitrage
//! transactions, detects constant-product pool imbalances, persists both
//! streams to PostgreSQL and fans them out to filtered WebSocket
//! subscribers.

pub mod aggregator;
pub mod analyzer;
pub mod circuit_breaker;
pub mod config;
pub mod connector;
pub mod database;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod monitor;
pub mod profit;
pub mod scanner;
pub mod schema;
pub mod stream;
pub mod tracker;
pub mod types;
