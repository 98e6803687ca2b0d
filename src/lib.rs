pub mod bridge;
pub mod config;
pub mod database;
pub mod formatter;
pub mod matrix;
pub mod qq;
pub mod util;
pub mod web;
