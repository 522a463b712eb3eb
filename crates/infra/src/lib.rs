//! Infrastructure layer: the job queue engine, storage adapters, the service
//! transition guard and configuration loading.

pub mod config;
pub mod jobs;
pub mod service;
