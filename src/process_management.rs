//! Process management subsystem.
//!
//! Runs the emulated device binaries and the external tools around them.
//!
//! Re-exports:
//! - [`DeviceProcess`]: one device binary in its own process group, with its
//!   output exposed as [`LogLines`].
//! - [`DacGenerator`], [`PayloadGenerator`]: external tool seams.
//! - [`DeviceLogRecorder`]: per-session copy of the device output.
//!
//! Example (non-running):
//! ```ignore
//! use matter_emu::process_management::{DeviceCommand, DeviceProcess};
//!
//! let mut process = DeviceProcess::new(command, Duration::from_secs(5));
//! process.execute()?;
//! let mut lines = process.log_lines()?;
//! while let Some(line) = lines.next_line().await {
//!     println!("{}", line);
//! }
//! process.stop().await;
//! ```

pub mod device_log;
pub mod device_process;
pub mod external_tools;
pub mod types;

pub use device_log::{prune_log_days, DeviceLogRecorder};
pub use device_process::{DeviceProcess, LogLines};
pub use external_tools::{
    CommandDacGenerator, CommandPayloadGenerator, DacGenerator, PayloadGenerator, SkipDacGenerator,
};
pub use types::{DeviceCommand, LaunchParams, OnboardingCodes, PayloadParams};
