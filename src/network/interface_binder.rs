use crate::error_handling::types::NetworkError;
use log::{debug, error, info};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

/// Adds and removes address aliases on the host interface.
pub trait InterfaceBinder: Send + Sync {
    fn bind_ipv4(&self, addr: Ipv4Addr, interface_index: u32) -> Result<(), NetworkError>;
    fn bind_ipv6(&self, addr: Ipv6Addr) -> Result<(), NetworkError>;
    fn unbind(&self, addr: IpAddr) -> Result<(), NetworkError>;
}

/// Binder backed by iproute2.
///
/// IPv4 aliases are added as `/24` with the label `<interface>:<index>` so they
/// can be found again after a crash; IPv6 aliases are added as `/128`.
pub struct IpCommandBinder {
    interface: String,
    use_sudo: bool,
}

impl IpCommandBinder {
    pub fn new(interface: &str, use_sudo: bool) -> Self {
        Self {
            interface: interface.to_string(),
            use_sudo,
        }
    }

    fn ipv4_add_args(&self, addr: Ipv4Addr, interface_index: u32) -> Vec<String> {
        vec![
            "addr".into(),
            "add".into(),
            format!("{}/24", addr),
            "dev".into(),
            self.interface.clone(),
            "label".into(),
            format!("{}:{}", self.interface, interface_index),
        ]
    }

    fn ipv6_add_args(&self, addr: Ipv6Addr) -> Vec<String> {
        vec![
            "-6".into(),
            "addr".into(),
            "add".into(),
            format!("{}/128", addr),
            "dev".into(),
            self.interface.clone(),
        ]
    }

    fn del_args(&self, addr: IpAddr) -> Vec<String> {
        match addr {
            IpAddr::V4(a) => vec![
                "addr".into(),
                "del".into(),
                format!("{}/24", a),
                "dev".into(),
                self.interface.clone(),
            ],
            IpAddr::V6(a) => vec![
                "-6".into(),
                "addr".into(),
                "del".into(),
                format!("{}/128", a),
                "dev".into(),
                self.interface.clone(),
            ],
        }
    }

    fn run_ip(&self, args: &[String]) -> Result<(), NetworkError> {
        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("ip");
            c
        } else {
            Command::new("ip")
        };
        cmd.args(args);
        debug!("Running ip {}", args.join(" "));

        let output = cmd.output().map_err(|e| {
            error!("Failed to run ip {}: {}", args.join(" "), e);
            NetworkError::BindFailed(e.to_string())
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("ip {} failed: {}", args.join(" "), stderr);
            return Err(NetworkError::BindFailed(stderr));
        }
        Ok(())
    }
}

impl InterfaceBinder for IpCommandBinder {
    fn bind_ipv4(&self, addr: Ipv4Addr, interface_index: u32) -> Result<(), NetworkError> {
        self.run_ip(&self.ipv4_add_args(addr, interface_index))?;
        info!("Bound {} on {}:{}", addr, self.interface, interface_index);
        Ok(())
    }

    fn bind_ipv6(&self, addr: Ipv6Addr) -> Result<(), NetworkError> {
        self.run_ip(&self.ipv6_add_args(addr))?;
        info!("Bound {} on {}", addr, self.interface);
        Ok(())
    }

    fn unbind(&self, addr: IpAddr) -> Result<(), NetworkError> {
        self.run_ip(&self.del_args(addr))?;
        info!("Removed {} from {}", addr, self.interface);
        Ok(())
    }
}
