//! Leased transactions and the entries scoped to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qkv_proto::v1;
use qkv_types::{decode_optional, encode_optional, Key, KvError, Quorum, TransactionIndex, Value, Version};

use crate::client::ContextClient;
use crate::scope::AsyncClose;
use crate::task::{self, LoopHandle};

impl ContextClient {
    /// Opens a transaction; the store allocates its index.
    pub async fn transaction(&self) -> Result<Transaction, KvError> {
        let resp = self.request(v1::CreateTransactionRequest {}).await?;
        tracing::debug!(index = resp.index, "transaction opened");
        Ok(self.attach_transaction(resp.index))
    }

    /// Binds to an index opened elsewhere. No request is sent; the index is
    /// trusted to name an active transaction.
    pub fn attach_transaction(&self, index: TransactionIndex) -> Transaction {
        Transaction {
            client: self.clone(),
            binding: Binding {
                index,
                completed: Arc::new(AtomicBool::new(false)),
            },
        }
    }
}

/// Index plus the shared completion flag. Handed to entries and tree
/// cursors so they refuse to issue requests once the transaction is over.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    index: TransactionIndex,
    completed: Arc<AtomicBool>,
}

impl Binding {
    pub(crate) fn active_index(&self) -> Result<TransactionIndex, KvError> {
        if self.completed.load(Ordering::Acquire) {
            return Err(KvError::TransactionCompleted { index: self.index });
        }
        Ok(self.index)
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    // The store has finished with the transaction on success, and also when
    // it reports the transaction as unknown, interrupted or already done.
    fn settle(&self, result: Result<(), KvError>, outcome: &str) -> Result<(), KvError> {
        let terminal = match &result {
            Ok(()) => true,
            Err(e) => matches!(
                e,
                KvError::TransactionCompleted { .. }
                    | KvError::TransactionInterrupted { .. }
                    | KvError::TransactionNotFound { .. }
            ),
        };
        if terminal {
            self.completed.store(true, Ordering::Release);
        }
        match &result {
            Ok(()) => tracing::debug!(index = self.index, "transaction {outcome}"),
            Err(error) => tracing::debug!(index = self.index, %error, "transaction not {outcome}"),
        }
        result
    }
}

async fn rollback(client: &ContextClient, binding: &Binding) -> Result<(), KvError> {
    if binding.is_completed() {
        return Ok(());
    }
    let index = binding.index;
    let result = client.request(v1::RollbackTransactionRequest { index }).await;
    binding.settle(result.map(|_| ()), "rolled back")
}

pub struct Transaction {
    client: ContextClient,
    binding: Binding,
}

impl Transaction {
    pub fn index(&self) -> TransactionIndex {
        self.binding.index
    }

    pub fn is_completed(&self) -> bool {
        self.binding.is_completed()
    }

    pub(crate) fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Renews the store-side lease.
    pub async fn keep_alive(&self) -> Result<(), KvError> {
        let index = self.binding.active_index()?;
        self.client.request(v1::KeepAliveRequest { index }).await?;
        Ok(())
    }

    /// Sends `keep_alive` every `period` on a background task until the
    /// returned handle is stopped or dropped, or the transaction completes.
    /// Failed renewals are logged.
    pub fn keep_alive_every(&self, period: Duration) -> LoopHandle {
        let client = self.client.clone();
        let binding = self.binding.clone();
        let watched = self.binding.clone();
        task::spawn_logged_loop_while(move || !watched.is_completed(), move || {
            let client = client.clone();
            let binding = binding.clone();
            async move {
                tokio::time::sleep(period).await;
                if binding.is_completed() {
                    return Ok(());
                }
                client
                    .request(v1::KeepAliveRequest { index: binding.index })
                    .await
                    .map(|_| ())
            }
        })
    }

    /// Commits. A no-op once the transaction has completed.
    pub async fn commit(&self) -> Result<(), KvError> {
        if self.is_completed() {
            return Ok(());
        }
        let index = self.binding.index;
        let result = self.client.request(v1::CommitTransactionRequest { index }).await;
        self.binding.settle(result.map(|_| ()), "committed")
    }

    /// Rolls back. A no-op once the transaction has completed.
    pub async fn rollback(&self) -> Result<(), KvError> {
        rollback(&self.client, &self.binding).await
    }

    /// Reads `key` as seen from inside the transaction.
    pub async fn get<T: Value>(&self, key: impl Into<Key>, quorum: Quorum) -> Result<TransactionEntry<T>, KvError> {
        let mut entry = self.entry(key, quorum);
        entry.refresh().await?;
        Ok(entry)
    }

    /// Unbound transaction entry at version 0. No request is sent.
    pub fn entry<T: Value>(&self, key: impl Into<Key>, quorum: Quorum) -> TransactionEntry<T> {
        TransactionEntry {
            client: self.client.clone(),
            binding: self.binding.clone(),
            key: key.into(),
            quorum,
            version: 0,
            value: None,
        }
    }

    /// View of this transaction that supplies `quorum` to every entry it
    /// creates.
    pub fn with_quorum(&self, quorum: Quorum) -> TransactionQuorum<'_> {
        TransactionQuorum { transaction: self, quorum }
    }
}

impl AsyncClose for Transaction {
    async fn close(&self, failed: bool) -> Result<(), KvError> {
        if failed {
            self.rollback().await
        } else {
            self.commit().await
        }
    }

    fn close_detached(&self) {
        if self.is_completed() {
            return;
        }
        let client = self.client.clone();
        let binding = self.binding.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = rollback(&client, &binding).await {
                        tracing::warn!(index = binding.index, %error, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(index = self.binding.index, "no runtime to roll back abandoned transaction; the lease will expire it");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("index", &self.binding.index)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A transaction paired with fixed quorum parameters.
pub struct TransactionQuorum<'a> {
    transaction: &'a Transaction,
    quorum: Quorum,
}

impl TransactionQuorum<'_> {
    pub fn transaction(&self) -> &Transaction {
        self.transaction
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    pub async fn keep_alive(&self) -> Result<(), KvError> {
        self.transaction.keep_alive().await
    }

    pub async fn commit(&self) -> Result<(), KvError> {
        self.transaction.commit().await
    }

    pub async fn rollback(&self) -> Result<(), KvError> {
        self.transaction.rollback().await
    }

    pub async fn get<T: Value>(&self, key: impl Into<Key>) -> Result<TransactionEntry<T>, KvError> {
        self.transaction.get(key, self.quorum).await
    }

    pub fn entry<T: Value>(&self, key: impl Into<Key>) -> TransactionEntry<T> {
        self.transaction.entry(key, self.quorum)
    }
}

impl AsyncClose for TransactionQuorum<'_> {
    async fn close(&self, failed: bool) -> Result<(), KvError> {
        self.transaction.close(failed).await
    }

    fn close_detached(&self) {
        self.transaction.close_detached()
    }
}

/// An entry whose reads and writes go through a transaction.
pub struct TransactionEntry<T> {
    client: ContextClient,
    binding: Binding,
    key: Key,
    quorum: Quorum,
    version: Version,
    value: Option<T>,
}

impl<T: Value> TransactionEntry<T> {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn index(&self) -> TransactionIndex {
        self.binding.index
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

    pub async fn refresh(&mut self) -> Result<(), KvError> {
        let index = self.binding.active_index()?;
        let resp = self
            .client
            .request(v1::TransactGetRequest {
                replicas: Some(self.quorum.into()),
                index,
                key: self.key.as_bytes().to_vec(),
            })
            .await?;
        self.value = decode_optional(resp.value.as_deref())?;
        self.version = resp.version;
        Ok(())
    }

    /// Stages an unconditional write.
    pub async fn set(&mut self, value: impl Into<Option<T>>) -> Result<Version, KvError> {
        self.write(value.into(), None).await?;
        Ok(self.version)
    }

    /// Stages a write guarded by the cached version. The guard is checked
    /// now and again at commit; a later conflict interrupts the commit.
    /// On `false` the entry is left as it was.
    pub async fn cas(&mut self, value: impl Into<Option<T>>) -> Result<bool, KvError> {
        let expected = self.version;
        self.write(value.into(), Some(expected)).await
    }

    async fn write(&mut self, value: Option<T>, expected: Option<Version>) -> Result<bool, KvError> {
        let index = self.binding.active_index()?;
        let resp = self
            .client
            .request(v1::TransactSetRequest {
                replicas: Some(self.quorum.into()),
                index,
                key: self.key.as_bytes().to_vec(),
                value: encode_optional(value.as_ref())?,
                cas: expected.is_some(),
                version: expected.unwrap_or_default(),
            })
            .await?;
        if resp.status {
            self.value = value;
            self.version = resp.version;
        }
        Ok(resp.status)
    }
}
