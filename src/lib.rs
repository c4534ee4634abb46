//! SENGA Trading Engine Library
//!
//! This library provides the core components for the SENGA automated trading engine:
//! market-data pipeline, mean-reversion signal engine, risk gate, and order
//! lifecycle manager, wired together through an in-process event bus and a
//! SQLite store.

pub mod application;
pub mod config;
pub mod domain;
pub mod events;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
