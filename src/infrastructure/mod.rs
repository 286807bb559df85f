pub mod config;
pub mod error;
pub mod focus_store;
pub mod logging;
pub mod rest_store;
pub mod sqlite_store;
pub mod storage;
