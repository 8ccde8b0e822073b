use crate::KvError;

/// Payload codec for entry and cursor values.
///
/// `decode` plays the role of the "new empty instance" factory: the client
/// never needs a reflective allocator, each call site is monomorphised on
/// the value type.
pub trait Value: Sized + Send + Sync + 'static {
    fn encode(&self) -> Result<Vec<u8>, KvError>;
    fn decode(bytes: &[u8]) -> Result<Self, KvError>;
}

impl Value for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>, KvError> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        Ok(bytes.to_vec())
    }
}

impl Value for String {
    fn encode(&self) -> Result<Vec<u8>, KvError> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| KvError::Codec(e.to_string()))
    }
}

impl Value for u64 {
    fn encode(&self) -> Result<Vec<u8>, KvError> {
        Ok(self.to_be_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| KvError::Codec(format!("expected 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// Adapter storing any serde type as a `bincode` blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bincode<T>(pub T);

impl<T> Value for Bincode<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Vec<u8>, KvError> {
        bincode::serde::encode_to_vec(&self.0, bincode::config::standard())
            .map_err(|e| KvError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(v, _)| Bincode(v))
            .map_err(|e| KvError::Codec(e.to_string()))
    }
}

/// `None` on the wire is "absent"; a present field is always decoded, even
/// when it is zero-length.
pub fn decode_optional<T: Value>(bytes: Option<&[u8]>) -> Result<Option<T>, KvError> {
    bytes.map(T::decode).transpose()
}

pub fn encode_optional<T: Value>(value: Option<&T>) -> Result<Option<Vec<u8>>, KvError> {
    value.map(Value::encode).transpose()
}
