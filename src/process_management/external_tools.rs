//! External tools invoked around a device start.
//!
//! Both tools are opaque command-line programs. The DAC tool gets the target id
//! and must print its success marker; the payload tool gets the pairing
//! parameters and prints the QR and manual pairing codes. Calls block, so the
//! orchestrator runs them off the async runtime.

use crate::configuration::types::ToolConfig;
use crate::error_handling::types::ProcessError;
use crate::process_management::types::{OnboardingCodes, PayloadParams};
use log::{debug, error, info, warn};
use regex::Regex;
use std::process::Command;

/// Printed by the DAC tool when the attestation files were written.
pub const DAC_SUCCESS_MARKER: &str = "The DAC files were successfully created";

pub trait DacGenerator: Send + Sync {
    fn generate(&self, target_id: &str) -> Result<(), ProcessError>;
}

pub trait PayloadGenerator: Send + Sync {
    fn generate(&self, params: &PayloadParams) -> Result<OnboardingCodes, ProcessError>;
}

fn run_tool(tool: &ToolConfig, extra_args: &[String]) -> Result<String, ProcessError> {
    debug!(
        "Running {} {} {}",
        tool.program.display(),
        tool.args.join(" "),
        extra_args.join(" ")
    );
    let output = Command::new(&tool.program)
        .args(&tool.args)
        .args(extra_args)
        .output()
        .map_err(|e| {
            error!("Failed to run {}: {}", tool.program.display(), e);
            ProcessError::ToolFailed(format!("{}: {}", tool.program.display(), e))
        })?;
    if !output.status.success() {
        warn!(
            "{} exited with {}: {}",
            tool.program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct CommandDacGenerator {
    tool: ToolConfig,
}

impl CommandDacGenerator {
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }
}

impl DacGenerator for CommandDacGenerator {
    fn generate(&self, target_id: &str) -> Result<(), ProcessError> {
        let stdout = run_tool(&self.tool, &[target_id.to_string()])?;
        if stdout.contains(DAC_SUCCESS_MARKER) {
            info!("DAC generated for {}", target_id);
            Ok(())
        } else {
            error!("DAC generation failed for {}", target_id);
            Err(ProcessError::ToolFailed(format!(
                "DAC generation failed for {}",
                target_id
            )))
        }
    }
}

/// Used when no DAC tool is configured; devices then run with their built-in
/// test credentials.
pub struct SkipDacGenerator;

impl DacGenerator for SkipDacGenerator {
    fn generate(&self, target_id: &str) -> Result<(), ProcessError> {
        debug!("No DAC tool configured, skipping generation for {}", target_id);
        Ok(())
    }
}

pub struct CommandPayloadGenerator {
    tool: ToolConfig,
    qr_pattern: Regex,
    manual_pattern: Regex,
}

impl CommandPayloadGenerator {
    pub fn new(tool: ToolConfig) -> Result<Self, ProcessError> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| {
                error!("Invalid pairing code pattern {}: {}", p, e);
                ProcessError::ToolFailed(e.to_string())
            })
        };
        Ok(Self {
            tool,
            qr_pattern: compile(r"MT:[0-9A-Z.\-]+")?,
            manual_pattern: compile(r"\b\d{4}-?\d{3}-?\d{4}(?:-?\d{5}-?\d{5})?\b")?,
        })
    }

    fn parse_codes(&self, stdout: &str) -> Option<OnboardingCodes> {
        let qr_code = self.qr_pattern.find(stdout)?.as_str().to_string();
        let manual_code = stdout
            .lines()
            .filter(|l| !l.contains("MT:"))
            .find_map(|l| self.manual_pattern.find(l))?
            .as_str()
            .to_string();
        Some(OnboardingCodes {
            qr_code,
            manual_code,
        })
    }
}

impl PayloadGenerator for CommandPayloadGenerator {
    fn generate(&self, params: &PayloadParams) -> Result<OnboardingCodes, ProcessError> {
        let args = [
            "--passcode".to_string(),
            params.passcode.to_string(),
            "--discriminator".to_string(),
            params.discriminator.to_string(),
            "--vendor-id".to_string(),
            params.vendor_id.to_string(),
            "--product-id".to_string(),
            params.product_id.to_string(),
        ];
        let stdout = run_tool(&self.tool, &args)?;
        self.parse_codes(&stdout).ok_or_else(|| {
            error!("Payload tool printed no pairing codes");
            ProcessError::ToolFailed("no pairing codes in payload tool output".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> ToolConfig {
        ToolConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into(), "tool".into()],
        }
    }

    #[test]
    fn test_dac_success_requires_marker() {
        let ok = CommandDacGenerator::new(sh(&format!("echo \"$1: {}\"", DAC_SUCCESS_MARKER)));
        assert!(ok.generate("fff18014-7e5").is_ok());

        let failed = CommandDacGenerator::new(sh("echo 'openssl: error'"));
        assert!(matches!(
            failed.generate("fff18014-7e5"),
            Err(ProcessError::ToolFailed(_))
        ));

        let missing = CommandDacGenerator::new(ToolConfig {
            program: PathBuf::from("/nonexistent/gen-dac"),
            args: vec![],
        });
        assert!(missing.generate("x").is_err());
    }

    #[test]
    fn test_payload_codes_are_parsed() {
        let generator = CommandPayloadGenerator::new(sh(
            "echo 'QR code: MT:Y.K9042C00KA0648G00'; echo 'Manual code: 3497-011-2332'",
        ))
        .unwrap();
        let codes = generator
            .generate(&PayloadParams {
                passcode: 20202021,
                discriminator: 3840,
                vendor_id: 65521,
                product_id: 32788,
            })
            .unwrap();
        assert_eq!(codes.qr_code, "MT:Y.K9042C00KA0648G00");
        assert_eq!(codes.manual_code, "3497-011-2332");
    }

    #[test]
    fn test_payload_without_codes_fails() {
        let generator = CommandPayloadGenerator::new(sh("echo nothing")).unwrap();
        let params = PayloadParams {
            passcode: 1,
            discriminator: 1,
            vendor_id: 1,
            product_id: 1,
        };
        assert!(generator.generate(&params).is_err());
    }

    #[test]
    fn test_payload_tool_receives_parameters() {
        let generator = CommandPayloadGenerator::new(sh(
            "echo \"MT:ABC\"; echo \"$2$4\" | sed 's/\\(....\\)\\(...\\)\\(....\\).*/\\1-\\2-\\3/'",
        ))
        .unwrap();
        let codes = generator
            .generate(&PayloadParams {
                passcode: 20202021,
                discriminator: 3840,
                vendor_id: 65521,
                product_id: 32788,
            })
            .unwrap();
        assert_eq!(codes.manual_code, "2020-202-1384");
    }
}
