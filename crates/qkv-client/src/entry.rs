//! Quorum entries: a key's last observed version and value, plus the
//! operations that read and write it.

use std::time::Duration;

use qkv_proto::v1::{self, SetCondition};
use qkv_types::{decode_optional, encode_optional, Expire, Key, KvError, Quorum, Value, Version};

use crate::client::ContextClient;

impl ContextClient {
    /// Fetches `key` and returns an entry holding the store's current state.
    pub async fn get<T: Value>(&self, key: impl Into<Key>, quorum: Quorum) -> Result<Entry<T>, KvError> {
        let mut entry = self.entry(key, quorum);
        entry.refresh().await?;
        Ok(entry)
    }

    /// Version only; the value is not transferred.
    pub async fn get_version(&self, key: impl Into<Key>, quorum: Quorum) -> Result<Version, KvError> {
        let resp = self
            .request(v1::GetVersionRequest {
                replicas: Some(quorum.into()),
                key: key.into().into_bytes(),
            })
            .await?;
        Ok(resp.version)
    }

    /// An unbound entry at version 0 with no value. No request is sent.
    pub fn entry<T: Value>(&self, key: impl Into<Key>, quorum: Quorum) -> Entry<T> {
        Entry {
            client: self.clone(),
            key: key.into(),
            quorum,
            version: 0,
            value: None,
        }
    }
}

/// Client-local view of one key.
///
/// Writes update the cached version and value only when the store accepts
/// them. Concurrent calls on the same entry race; the last response to
/// arrive wins.
pub struct Entry<T> {
    client: ContextClient,
    key: Key,
    quorum: Quorum,
    version: Version,
    value: Option<T>,
}

impl<T: Value> Entry<T> {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Re-reads the key, replacing the cached version and value.
    pub async fn refresh(&mut self) -> Result<(), KvError> {
        let resp = self
            .client
            .request(v1::GetRequest {
                replicas: Some(self.quorum.into()),
                key: self.key.as_bytes().to_vec(),
            })
            .await?;
        self.value = decode_optional(resp.value.as_deref())?;
        self.version = resp.version;
        Ok(())
    }

    /// Unconditional write. Returns the version the store assigned.
    pub async fn set(&mut self, value: impl Into<Option<T>>) -> Result<Version, KvError> {
        self.set_with_expire(value, Expire::None).await
    }

    pub async fn set_with_expire(
        &mut self,
        value: impl Into<Option<T>>,
        expire: Expire,
    ) -> Result<Version, KvError> {
        self.write(value.into(), SetCondition::Always, expire).await?;
        Ok(self.version)
    }

    /// Writes only if the store still holds the cached version.
    ///
    /// On `false` the entry keeps its stale state; call [`Entry::refresh`]
    /// before retrying.
    pub async fn cas(&mut self, value: impl Into<Option<T>>) -> Result<bool, KvError> {
        self.cas_with_expire(value, Expire::None).await
    }

    pub async fn cas_with_expire(
        &mut self,
        value: impl Into<Option<T>>,
        expire: Expire,
    ) -> Result<bool, KvError> {
        self.write(value.into(), SetCondition::Version, expire).await
    }

    /// Writes only if the key currently holds no value.
    pub async fn set_if_absent(&mut self, value: impl Into<Option<T>>) -> Result<bool, KvError> {
        self.write(value.into(), SetCondition::NotExists, Expire::None).await
    }

    /// Writes only if the key currently holds a value.
    pub async fn set_if_present(&mut self, value: impl Into<Option<T>>) -> Result<bool, KvError> {
        self.write(value.into(), SetCondition::Exists, Expire::None).await
    }

    async fn write(
        &mut self,
        value: Option<T>,
        condition: SetCondition,
        expire: Expire,
    ) -> Result<bool, KvError> {
        let resp = self
            .client
            .request(v1::SetRequest {
                replicas: Some(self.quorum.into()),
                key: self.key.as_bytes().to_vec(),
                value: encode_optional(value.as_ref())?,
                condition: condition as i32,
                version: self.version,
                expire: expire.to_wire(),
            })
            .await?;
        if resp.status {
            self.value = value;
            self.version = resp.version;
        }
        Ok(resp.status)
    }

    /// Waits, without a deadline, until the key moves off the cached version.
    pub async fn listen(&mut self) -> Result<(), KvError> {
        self.listen_for(self.version).await
    }

    /// Waits until the key's version differs from `version`.
    pub async fn listen_for(&mut self, version: Version) -> Result<(), KvError> {
        self.wait(version, None).await
    }

    /// Like [`Entry::listen_for`] but fails with [`KvError::Timeout`] once
    /// `timeout` elapses.
    pub async fn listen_timeout(&mut self, version: Version, timeout: Duration) -> Result<(), KvError> {
        self.wait(version, Some(timeout)).await
    }

    async fn wait(&mut self, version: Version, timeout: Option<Duration>) -> Result<(), KvError> {
        let timeout_ms = timeout.map_or(0, |t| t.as_millis().clamp(1, u32::MAX as u128) as u32);
        let resp = self
            .client
            .request_with_timeout(
                v1::ListenRequest {
                    replicas: Some(v1::Replicas::for_listen(self.quorum)),
                    key: self.key.as_bytes().to_vec(),
                    version,
                    timeout_ms,
                },
                timeout,
            )
            .await?;
        self.value = decode_optional(resp.value.as_deref())?;
        self.version = resp.version;
        Ok(())
    }
}

impl<T: Value + std::fmt::Debug> std::fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("value", &self.value)
            .finish()
    }
}
