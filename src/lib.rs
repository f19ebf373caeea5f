pub mod configuration;
pub mod db;
pub mod helpers;
pub mod models;
pub mod services;
pub mod telemetry;
