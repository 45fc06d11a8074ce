use std::fs;
use std::path::Path;

use hashbrown::HashMap;
use tracing::warn;

use super::error::Result;
use super::Guid;

/// Wire size of a node description, per the management datagram format.
pub const NODE_DESC_LEN: usize = 64;

/// GUID → human-readable name mapping, loaded once at startup from a
/// line-oriented file: one entry per line, `#` lines ignored, otherwise
/// `<guid in decimal or 0x-hex><whitespace>["]<name>["]`.
#[derive(Debug, Default, Clone)]
pub struct NodeNameMap {
    names: HashMap<Guid, String>,
}

impl NodeNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parses the map from file contents. Malformed lines are skipped,
    /// not fatal: a bad name map must not stop the subnet manager.
    pub fn parse(text: &str) -> Self {
        let mut names = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((token, rest)) = line.split_once(char::is_whitespace)
            else {
                warn!("name map line {}: no name after guid", lineno + 1);
                continue;
            };
            let guid = match parse_guid(token) {
                Some(guid) => guid,
                None => {
                    warn!("name map line {}: bad guid {:?}", lineno + 1, token);
                    continue;
                }
            };
            let name = rest.trim().trim_matches('"').trim();
            if name.is_empty() {
                warn!("name map line {}: empty name", lineno + 1);
                continue;
            }
            names.insert(guid, name.to_owned());
        }
        Self { names }
    }

    pub fn lookup(&self, guid: Guid) -> Option<&str> {
        self.names.get(&guid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn parse_guid(token: &str) -> Option<Guid> {
    if let Some(hex) = token.strip_prefix("0x").or(token.strip_prefix("0X")) {
        Guid::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

/// Cleans a raw node description as received off the wire: everything from
/// the first NUL is dropped, non-printable bytes become spaces, and
/// surrounding whitespace is trimmed.
pub fn clean_description(raw: &[u8; NODE_DESC_LEN]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(NODE_DESC_LEN);
    raw[..len]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect::<String>()
        .trim()
        .to_owned()
}

/// Lays a description string back out as the fixed 64-byte wire field,
/// truncated and NUL-padded.
pub fn description_bytes(desc: &str) -> [u8; NODE_DESC_LEN] {
    let mut raw = [0u8; NODE_DESC_LEN];
    for (slot, byte) in raw.iter_mut().zip(desc.bytes()) {
        *slot = byte;
    }
    raw
}
