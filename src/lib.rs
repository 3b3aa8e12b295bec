pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod repo;
pub mod telemetry;
