use crate::network::types::SessionResources;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Name of the record file inside every session directory.
pub const FACTORY_FILE: &str = "chip_factory.ini";

const SECTION_HEADER: &str = "[DEFAULT]";

pub const KEY_PRODUCT_ID: &str = "product-id";
pub const KEY_SERIAL_NUM: &str = "serial-num";
pub const KEY_DISCRIMINATOR: &str = "discriminator";
pub const KEY_PIN_CODE: &str = "pin-code";
pub const KEY_DEVICE_TYPE: &str = "device-type";
pub const KEY_CREATE_TIME: &str = "create-time";
pub const KEY_IPV4: &str = "ipv4";
pub const KEY_IPV6: &str = "ipv6";
pub const KEY_RPC_PORT: &str = "rpc-port";
pub const KEY_INTERFACE_INDEX: &str = "interface_index";
pub const KEY_IS_RECOVER: &str = "is_recover";
pub const KEY_VENDOR_ID: &str = "vendor-id";
pub const KEY_UNIQUE_ID: &str = "unique-id";

/// Keys whose absence makes a record incomplete.
pub const REQUIRED_KEYS: [&str; 9] = [
    KEY_PRODUCT_ID,
    KEY_SERIAL_NUM,
    KEY_DISCRIMINATOR,
    KEY_PIN_CODE,
    KEY_DEVICE_TYPE,
    KEY_CREATE_TIME,
    KEY_IPV4,
    KEY_IPV6,
    KEY_RPC_PORT,
];

const KEY_ORDER: [&str; 13] = [
    KEY_PRODUCT_ID,
    KEY_SERIAL_NUM,
    KEY_DISCRIMINATOR,
    KEY_PIN_CODE,
    KEY_DEVICE_TYPE,
    KEY_CREATE_TIME,
    KEY_IPV4,
    KEY_IPV6,
    KEY_RPC_PORT,
    KEY_INTERFACE_INDEX,
    KEY_IS_RECOVER,
    KEY_VENDOR_ID,
    KEY_UNIQUE_ID,
];

/// The persisted factory record of one session.
///
/// Addresses and port are empty until allocation succeeded; `is_recover` is set
/// once the device has been commissioned and should be resumed after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryRecord {
    pub product_id: u16,
    pub serial_number: u64,
    pub discriminator: u16,
    pub pin_code: u32,
    pub device_type: String,
    pub create_time: i64,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub rpc_port: Option<u16>,
    pub interface_index: Option<u32>,
    pub is_recover: bool,
    pub vendor_id: Option<u16>,
    pub unique_id: Option<String>,
    /// Keys written by other parties (the device process) that must survive rewrites.
    pub extra: BTreeMap<String, String>,
}

impl FactoryRecord {
    pub fn resources(&self) -> SessionResources {
        SessionResources {
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            interface_index: self.interface_index,
            rpc_port: self.rpc_port,
        }
    }

    pub fn set_resources(&mut self, resources: &SessionResources) {
        self.ipv4 = resources.ipv4;
        self.ipv6 = resources.ipv6;
        self.interface_index = resources.interface_index;
        self.rpc_port = resources.rpc_port;
    }

    /// Key/value pairs this record sets. Optional fields that are unset are
    /// left out so a rewrite keeps whatever the file already holds for them.
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = self.extra.clone();
        let mut put = |k: &str, v: String| {
            pairs.insert(k.to_string(), v);
        };
        put(KEY_PRODUCT_ID, self.product_id.to_string());
        put(KEY_SERIAL_NUM, self.serial_number.to_string());
        put(KEY_DISCRIMINATOR, self.discriminator.to_string());
        put(KEY_PIN_CODE, self.pin_code.to_string());
        put(KEY_DEVICE_TYPE, self.device_type.clone());
        put(KEY_CREATE_TIME, self.create_time.to_string());
        put(KEY_IPV4, self.ipv4.map(|a| a.to_string()).unwrap_or_default());
        put(KEY_IPV6, self.ipv6.map(|a| a.to_string()).unwrap_or_default());
        put(KEY_RPC_PORT, self.rpc_port.map(|p| p.to_string()).unwrap_or_default());
        put(KEY_IS_RECOVER, if self.is_recover { "1" } else { "0" }.to_string());
        if let Some(i) = self.interface_index {
            put(KEY_INTERFACE_INDEX, i.to_string());
        }
        if let Some(v) = self.vendor_id {
            put(KEY_VENDOR_ID, v.to_string());
        }
        if let Some(u) = &self.unique_id {
            put(KEY_UNIQUE_ID, u.clone());
        }
        pairs
    }

    /// Builds a record from parsed pairs. Returns the first required key that
    /// is missing or unparsable.
    pub fn from_pairs(mut pairs: BTreeMap<String, String>) -> Result<Self, String> {
        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !pairs.contains_key(**k)) {
            return Err(missing.to_string());
        }

        fn take(pairs: &mut BTreeMap<String, String>, key: &str) -> String {
            pairs.remove(key).unwrap_or_default()
        }
        fn required<T: std::str::FromStr>(
            pairs: &mut BTreeMap<String, String>,
            key: &str,
        ) -> Result<T, String> {
            take(pairs, key).parse::<T>().map_err(|_| key.to_string())
        }
        fn optional<T: std::str::FromStr>(
            pairs: &mut BTreeMap<String, String>,
            key: &str,
        ) -> Result<Option<T>, String> {
            let value = take(pairs, key);
            if value.is_empty() {
                return Ok(None);
            }
            value.parse::<T>().map(Some).map_err(|_| key.to_string())
        }

        let product_id = required(&mut pairs, KEY_PRODUCT_ID)?;
        let serial_number = required(&mut pairs, KEY_SERIAL_NUM)?;
        let discriminator = required(&mut pairs, KEY_DISCRIMINATOR)?;
        let pin_code = required(&mut pairs, KEY_PIN_CODE)?;
        let device_type = take(&mut pairs, KEY_DEVICE_TYPE);
        let create_time = required(&mut pairs, KEY_CREATE_TIME)?;
        let ipv4 = optional(&mut pairs, KEY_IPV4)?;
        let ipv6 = optional(&mut pairs, KEY_IPV6)?;
        let rpc_port = optional(&mut pairs, KEY_RPC_PORT)?;
        let interface_index = optional(&mut pairs, KEY_INTERFACE_INDEX)?;
        let is_recover = take(&mut pairs, KEY_IS_RECOVER) == "1";
        let vendor_id = optional(&mut pairs, KEY_VENDOR_ID)?;
        let unique_id = Some(take(&mut pairs, KEY_UNIQUE_ID)).filter(|u| !u.is_empty());

        Ok(Self {
            product_id,
            serial_number,
            discriminator,
            pin_code,
            device_type,
            create_time,
            ipv4,
            ipv6,
            rpc_port,
            interface_index,
            is_recover,
            vendor_id,
            unique_id,
            extra: pairs,
        })
    }
}

/// Parses the `key=value` lines of a record file. Section headers, blank lines
/// and comments are skipped.
pub fn parse_pairs(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('[') && !l.starts_with('#') && !l.starts_with(';'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Renders pairs with the well-known keys first, in their usual order.
pub fn render_pairs(pairs: &BTreeMap<String, String>) -> String {
    let mut out = String::from(SECTION_HEADER);
    out.push('\n');
    for key in KEY_ORDER {
        if let Some(value) = pairs.get(key) {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    for (key, value) in pairs.iter().filter(|(k, _)| !KEY_ORDER.contains(&k.as_str())) {
        out.push_str(&format!("{}={}\n", key, value));
    }
    out
}

/// A session directory that survived boot reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub target_id: String,
    pub record: FactoryRecord,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record() -> FactoryRecord {
        FactoryRecord {
            product_id: 32788,
            serial_number: 2021,
            discriminator: 3840,
            pin_code: 20202021,
            device_type: "0x0100".into(),
            create_time: 1_700_000_000,
            ipv4: Some(Ipv4Addr::new(192, 168, 1, 11)),
            ipv6: Some("fe80::11".parse().unwrap()),
            rpc_port: Some(33001),
            interface_index: Some(1),
            is_recover: true,
            vendor_id: Some(65521),
            unique_id: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_render_layout() {
        let rendered = render_pairs(&record().to_pairs());
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "[DEFAULT]");
        assert_eq!(lines[1], "product-id=32788");
        assert_eq!(lines[8], "ipv6=fe80::11");
        assert_eq!(lines[11], "is_recover=1");
        assert_eq!(lines[12], "vendor-id=65521");
        assert!(!rendered.contains("unique-id"));
    }

    #[test]
    fn test_parse_tolerates_spacing_and_unknown_keys() {
        let content = "[DEFAULT]\nproduct-id = 32788\nserial-num=2021\ndiscriminator=3840\n\
                       pin-code=20202021\ndevice-type=0x0100\ncreate-time=5\nipv4=\nipv6=\n\
                       rpc-port=\nunique-id=abc\nkvs-version = 2\n";
        let record = FactoryRecord::from_pairs(parse_pairs(content)).unwrap();
        assert_eq!(record.product_id, 32788);
        assert_eq!(record.ipv4, None);
        assert_eq!(record.rpc_port, None);
        assert!(!record.is_recover);
        assert_eq!(record.unique_id.as_deref(), Some("abc"));
        assert_eq!(record.extra.get("kvs-version").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_missing_required_key_is_reported() {
        let mut pairs = record().to_pairs();
        pairs.remove(KEY_RPC_PORT);
        assert_eq!(FactoryRecord::from_pairs(pairs).unwrap_err(), "rpc-port");

        let mut pairs = record().to_pairs();
        pairs.insert(KEY_SERIAL_NUM.into(), "not-a-number".into());
        assert_eq!(FactoryRecord::from_pairs(pairs).unwrap_err(), "serial-num");
    }
}
