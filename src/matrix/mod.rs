pub mod appservice;
pub mod attachment;
pub mod client;
pub mod types;

pub use appservice::AppserviceClient;
pub use client::{Intent, MatrixApi, SharedMatrixApi};
pub use types::*;
