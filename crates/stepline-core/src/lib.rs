pub mod execution;
pub mod repository;
pub mod service;
