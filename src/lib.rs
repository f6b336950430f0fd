pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod features;
pub mod models;
pub mod planner;
pub mod predictor;
pub mod progress;
pub mod report;
pub mod risk;
pub mod scheduling;
pub mod service;
pub mod store;

pub use error::ClinicError;
