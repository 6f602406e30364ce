pub mod error;
pub mod models;
pub mod reassembler;
pub mod settings;
pub mod transfer;
