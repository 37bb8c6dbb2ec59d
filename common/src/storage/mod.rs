pub mod db;
pub mod task_store;
pub mod types;
