//! Shared configuration, error and wire types for the push dispatch engine.

pub mod config;
pub mod db;
pub mod error;
pub mod types;
