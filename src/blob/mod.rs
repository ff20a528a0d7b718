// Blob 目标端模块

pub mod client;
pub mod types;

pub use client::RestBlobClient;
pub use types::*;
