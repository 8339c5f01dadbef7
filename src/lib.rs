pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod network;
pub mod process_management;
pub mod session_management;
pub mod storage;

pub use controller::Controller;
