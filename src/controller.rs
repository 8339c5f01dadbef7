//! Application controller.
//!
//! Boots the emulator (interface discovery, stale alias cleanup, storage
//! reconciliation, recovery), starts the configured devices, follows session
//! events until Ctrl-C and shuts every session down.

pub mod controller_handler;

pub use controller_handler::Controller;
