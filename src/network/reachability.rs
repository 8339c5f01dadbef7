use crate::error_handling::types::NetworkError;
use log::{debug, error, warn};
use regex::Regex;
use std::net::IpAddr;
use std::process::{Command, Stdio};

/// Tells whether something on the network already answers at an address.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, addr: IpAddr) -> bool;
}

/// ICMP echo through the system `ping` binary, sent out of one interface.
pub struct PingProbe {
    interface: String,
    wait_secs: u32,
    reply_pattern: Regex,
}

impl PingProbe {
    pub fn new(interface: &str) -> Result<Self, NetworkError> {
        let reply_pattern = Regex::new(r"([0-9]{1,3}) bytes from").map_err(|e| {
            error!("Invalid ping reply pattern: {}", e);
            NetworkError::CommandFailed(e.to_string())
        })?;
        Ok(Self {
            interface: interface.to_string(),
            wait_secs: 1,
            reply_pattern,
        })
    }

    /// A reply line reports a non-zero payload size.
    fn output_has_reply(&self, output: &str) -> bool {
        self.reply_pattern
            .captures_iter(output)
            .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
            .any(|bytes| bytes > 0)
    }
}

impl ReachabilityProbe for PingProbe {
    fn is_reachable(&self, addr: IpAddr) -> bool {
        let mut cmd = Command::new("ping");
        if addr.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.args(["-I", &self.interface, "-c", "1", "-W"])
            .arg(self.wait_secs.to_string())
            .arg(addr.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        match cmd.output() {
            Ok(output) => {
                let reachable = self.output_has_reply(&String::from_utf8_lossy(&output.stdout));
                debug!("ping {} via {}: reachable={}", addr, self.interface, reachable);
                reachable
            }
            Err(e) => {
                warn!("Failed to run ping for {}: {}", addr, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_detection() {
        let probe = PingProbe::new("eth0").unwrap();
        let alive = "PING 192.168.1.12 (192.168.1.12) from 192.168.1.10 eth0: 56(84) bytes of data.\n\
                     64 bytes from 192.168.1.12: icmp_seq=1 ttl=64 time=0.045 ms\n";
        let dead = "PING 192.168.1.13 (192.168.1.13) from 192.168.1.10 eth0: 56(84) bytes of data.\n\
                    \n--- 192.168.1.13 ping statistics ---\n1 packets transmitted, 0 received, 100% packet loss\n";
        assert!(probe.output_has_reply(alive));
        assert!(!probe.output_has_reply(dead));
        assert!(!probe.output_has_reply("0 bytes from 10.0.0.1"));
    }
}
