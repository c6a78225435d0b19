pub mod btle;
pub mod connection;
pub mod constants;
pub mod decoder;
pub mod radio;
pub mod registry;
pub mod session;
pub mod types;
