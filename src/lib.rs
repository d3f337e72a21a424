pub mod config;
pub mod db;
pub mod engine;
pub mod fts;
pub mod models;
pub mod storage;
