pub mod client;

pub use client::{EmrClient, EmrCredentials};
