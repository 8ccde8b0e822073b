mod error;
mod value;

use std::fmt;
use std::str::FromStr;

pub use error::{code, KvError, StatusCode};
pub use value::{decode_optional, encode_optional, Bincode, Value};

/// Per-key counter assigned by the store on every successful write.
/// `0` means the key has never been written (or has expired).
pub type Version = u64;

/// Server-assigned transaction session id. `0` is reserved for "no transaction".
pub type TransactionIndex = u64;

/// Ordered byte key. Ordering is byte-lexicographic, which is what tree
/// traversal relies on.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s.into_bytes())
    }
}

/// Replication parameters attached to every data request: fan-out `n`,
/// read quorum `r` and write quorum `w`.
///
/// The server is authoritative on whether a quorum can be met; the client
/// only rejects shapes that can never be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Quorum {
    n: u8,
    r: u8,
    w: u8,
}

impl Quorum {
    pub fn new(n: u8, r: u8, w: u8) -> Result<Self, KvError> {
        if n == 0 {
            return Err(KvError::InvalidArgument("quorum n must be at least 1".into()));
        }
        if r > n || w > n {
            return Err(KvError::InvalidArgument(format!(
                "quorum r={r} w={w} exceeds n={n}"
            )));
        }
        Ok(Quorum { n, r, w })
    }

    /// Single replica, used by local setups and tests.
    pub const fn single() -> Self {
        Quorum { n: 1, r: 1, w: 1 }
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    pub fn r(&self) -> u8 {
        self.r
    }

    pub fn w(&self) -> u8 {
        self.w
    }
}

impl Default for Quorum {
    fn default() -> Self {
        Quorum { n: 3, r: 2, w: 2 }
    }
}

/// Expiry hint passed through to the server on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expire {
    /// Clear any expiry on the key.
    #[default]
    None,
    /// Leave the key's current expiry untouched.
    Keep,
    /// Expire the key this many seconds after the write.
    After(u32),
}

impl Expire {
    pub const WIRE_NONE: i32 = 0;
    pub const WIRE_KEEP: i32 = -1;

    pub fn to_wire(self) -> i32 {
        match self {
            Expire::None => Self::WIRE_NONE,
            Expire::Keep => Self::WIRE_KEEP,
            Expire::After(secs) => secs.min(i32::MAX as u32) as i32,
        }
    }

    pub fn from_wire(raw: i32) -> Self {
        match raw {
            Self::WIRE_NONE => Expire::None,
            r if r < 0 => Expire::Keep,
            r => Expire::After(r as u32),
        }
    }
}

/// Endpoint a request is addressed to, e.g. `http://127.0.0.1:17400`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KvError::InvalidArgument("address must not be empty".into()));
        }
        if s.contains("://") {
            Ok(Address(s.to_string()))
        } else {
            Ok(Address(format!("http://{s}")))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_lexicographically() {
        let a = Key::from("a");
        let ab = Key::from("ab");
        let b = Key::from("b");
        assert!(a < ab);
        assert!(ab < b);
        assert!(Key::from(vec![0x00]) < Key::from(vec![0xff]));
        assert!(Key::default() < a);
    }

    #[test]
    fn quorum_rejects_impossible_shapes() {
        assert!(Quorum::new(3, 2, 2).is_ok());
        assert!(Quorum::new(0, 0, 0).is_err());
        assert!(Quorum::new(3, 4, 2).is_err());
        assert!(Quorum::new(3, 2, 4).is_err());
        assert_eq!(Quorum::default(), Quorum::new(3, 2, 2).unwrap());
    }

    #[test]
    fn expire_wire_mapping() {
        assert_eq!(Expire::None.to_wire(), 0);
        assert_eq!(Expire::Keep.to_wire(), -1);
        assert_eq!(Expire::After(30).to_wire(), 30);
        assert_eq!(Expire::from_wire(0), Expire::None);
        assert_eq!(Expire::from_wire(-1), Expire::Keep);
        assert_eq!(Expire::from_wire(5), Expire::After(5));
    }

    #[test]
    fn address_gets_default_scheme() {
        let a: Address = "127.0.0.1:17400".parse().unwrap();
        assert_eq!(a.as_str(), "http://127.0.0.1:17400");
        let b: Address = "https://kv.local:443".parse().unwrap();
        assert_eq!(b.as_str(), "https://kv.local:443");
        assert!("  ".parse::<Address>().is_err());
    }
}
