//! Compiled channel-message labels.
//!
//! A message transfer gets its own data channel whose label is its content
//! address:
//!
//! ```text
//! hex(name, 32 bytes zero-padded) ~ hex(merkle root) ~ hex(content hash) ~ hex(timestamp u64 BE)
//! ```
//!
//! Plain purpose labels (`"main"`, `"signaling"`) never contain `~`.

use crate::core::config::HASH_LEN;
use crate::core::error::{TransferError, TransferResult};
use crate::core::pipeline::merkle::Hash;

pub const LABEL_NAME_LEN: usize = 32;
const SEPARATOR: char = '~';

/// Length of every compiled label string.
pub const COMPILED_LABEL_LEN: usize = 2 * LABEL_NAME_LEN + 2 * HASH_LEN * 2 + 2 * 8 + 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelLabel {
    /// Logical channel the message belongs to (`"main"` by default).
    pub name: String,
    pub root: Hash,
    pub content_hash: Hash,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl ChannelLabel {
    pub fn new(name: &str, root: Hash, content_hash: Hash, timestamp: u64) -> TransferResult<Self> {
        if name.is_empty() || name.len() > LABEL_NAME_LEN || name.contains('\0') {
            return Err(TransferError::InvalidParameters(format!(
                "channel name must be 1..={LABEL_NAME_LEN} bytes without NUL"
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            root,
            content_hash,
            timestamp,
        })
    }

    pub fn compile(&self) -> String {
        let mut name = [0u8; LABEL_NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            hex::encode(name),
            hex::encode(self.root),
            hex::encode(self.content_hash),
            hex::encode(self.timestamp.to_be_bytes()),
        )
    }

    pub fn parse(label: &str) -> TransferResult<Self> {
        if label.len() != COMPILED_LABEL_LEN {
            return Err(TransferError::MalformedFrame("label length"));
        }
        let mut parts = label.split(SEPARATOR);
        let (Some(name), Some(root), Some(hash), Some(ts), None) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TransferError::MalformedFrame("label components"));
        };

        let name = decode_fixed::<LABEL_NAME_LEN>(name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(LABEL_NAME_LEN);
        let name = std::str::from_utf8(&name[..end])
            .map_err(|_| TransferError::MalformedFrame("label name utf-8"))?;

        Self::new(
            name,
            decode_fixed::<HASH_LEN>(root)?,
            decode_fixed::<HASH_LEN>(hash)?,
            u64::from_be_bytes(decode_fixed::<8>(ts)?),
        )
        .map_err(|_| TransferError::MalformedFrame("label name"))
    }

    /// Whether `label` looks like a compiled message label.
    pub fn is_compiled(label: &str) -> bool {
        label.len() == COMPILED_LABEL_LEN && label.contains(SEPARATOR)
    }
}

fn decode_fixed<const N: usize>(s: &str) -> TransferResult<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).map_err(|_| TransferError::MalformedFrame("label hex"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_parse() {
        let label = ChannelLabel::new("main", [7u8; 64], [9u8; 64], 0x0102).unwrap();
        let s = label.compile();
        assert_eq!(s.len(), COMPILED_LABEL_LEN);
        assert_eq!(s.matches('~').count(), 3);
        assert!(s.starts_with("6d61696e000000"));
        assert!(s.ends_with("0000000000000102"));
        assert!(ChannelLabel::is_compiled(&s));
        assert_eq!(ChannelLabel::parse(&s).unwrap(), label);
    }

    #[test]
    fn test_plain_labels_are_not_compiled() {
        assert!(!ChannelLabel::is_compiled("main"));
        assert!(!ChannelLabel::is_compiled("signaling"));
        assert!(ChannelLabel::parse("main").is_err());
    }

    #[test]
    fn test_name_bounds() {
        assert!(ChannelLabel::new("", [0; 64], [0; 64], 0).is_err());
        assert!(ChannelLabel::new(&"n".repeat(33), [0; 64], [0; 64], 0).is_err());
        assert!(ChannelLabel::new(&"n".repeat(32), [0; 64], [0; 64], 0).is_ok());
    }

    #[test]
    fn test_distinct_content_distinct_labels() {
        let a = ChannelLabel::new("main", [1; 64], [2; 64], 5).unwrap().compile();
        let b = ChannelLabel::new("main", [1; 64], [3; 64], 5).unwrap().compile();
        assert_ne!(a, b);
    }
}
