use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical 64-bit Zigbee address: lowercase, colon-separated hex
/// (`xx:xx:xx:xx:xx:xx:xx:xx`). Every table in the gateway is keyed by
/// this form; all user input funnels through [`Ieee::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ieee(String);

impl Ieee {
    /// Normalise an IEEE address from any accepted spelling: upper/lower
    /// case, `:` or `-` separators, or 16 bare hex digits.
    pub fn parse(raw: &str) -> Option<Ieee> {
        let s = raw.trim().to_lowercase().replace('-', ":");

        let hex: String = s.chars().filter(|c| *c != ':').collect();
        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let mut out = String::with_capacity(23);
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push(chunk[0] as char);
            out.push(chunk[1] as char);
        }
        Some(Ieee(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IEEE without colons: the `node_id` used in HA discovery topics.
    pub fn node_id(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for Ieee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_any_spelling() {
        let canonical = "00:11:22:33:44:55:aa:bb";
        for raw in [
            "00:11:22:33:44:55:aa:bb",
            "00:11:22:33:44:55:AA:BB",
            "001122334455aabb",
            "001122334455AABB",
            "00-11-22-33-44-55-aa-bb",
            "  00:11:22:33:44:55:aa:bb  ",
        ] {
            assert_eq!(Ieee::parse(raw).unwrap().as_str(), canonical, "input {raw:?}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Ieee::parse("").is_none());
        assert!(Ieee::parse("00:11:22").is_none());
        assert!(Ieee::parse("zz:11:22:33:44:55:aa:bb").is_none());
        assert!(Ieee::parse("001122334455aab").is_none());
    }

    #[test]
    fn node_id_strips_colons() {
        let ieee = Ieee::parse("aa:bb:cc:dd:ee:ff:00:11").unwrap();
        assert_eq!(ieee.node_id(), "aabbccddeeff0011");
    }

    #[test]
    fn serde_round_trip_is_transparent() {
        let ieee = Ieee::parse("00:11:22:33:44:55:66:77").unwrap();
        let json = serde_json::to_string(&ieee).unwrap();
        assert_eq!(json, "\"00:11:22:33:44:55:66:77\"");
        let back: Ieee = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ieee);
    }
}
