pub mod config;
pub mod embedding;
pub mod rate_limiter;
