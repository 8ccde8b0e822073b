//! In-memory reference implementation of the store's request handling.
//!
//! No replication happens here: quorum parameters are validated and then
//! ignored. The store exists so that the client can be exercised end to end
//! (directly through a loopback transport, or behind the gRPC gateway).

mod state;
mod tree;

use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use qkv_proto::v1::{self, Envelope};
use qkv_proto::RequestKind;
use qkv_types::{Expire, Key, KvError, Quorum};

use crate::state::{Slot, State};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StoreConfig {
    /// Transaction lease; renewed by every keep-alive.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Range size used when a request passes `limit == 0`.
    #[serde(default = "default_range_limit")]
    pub default_range_limit: u32,
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_range_limit() -> u32 {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            lease_ms: default_lease_ms(),
            default_range_limit: default_range_limit(),
        }
    }
}

pub struct MemStore {
    state: RwLock<State>,
    /// Bumped on every committed write; listeners wait on it.
    changes: watch::Sender<u64>,
    config: StoreConfig,
}

fn quorum(replicas: Option<&v1::Replicas>) -> Result<Quorum, KvError> {
    replicas
        .ok_or_else(|| KvError::InvalidArgument("replicas must be set".into()))?
        .to_quorum()
}

fn non_empty<'a>(bytes: &'a [u8], what: &str) -> Result<&'a [u8], KvError> {
    if bytes.is_empty() {
        return Err(KvError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(bytes)
}

impl MemStore {
    pub fn new(config: StoreConfig) -> Self {
        let (changes, _) = watch::channel(0);
        MemStore {
            state: RwLock::new(State::new(Duration::from_millis(config.lease_ms))),
            changes,
            config,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    // -----------------------------------------------------------------------
    // Plain keys
    // -----------------------------------------------------------------------

    pub async fn get(&self, req: v1::GetRequest) -> Result<v1::GetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let (version, value) = self.state.read().await.get(key, Instant::now());
        Ok(v1::GetResponse { version, value })
    }

    pub async fn get_version(
        &self,
        req: v1::GetVersionRequest,
    ) -> Result<v1::GetVersionResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let (version, _) = self.state.read().await.get(key, Instant::now());
        Ok(v1::GetVersionResponse { version })
    }

    pub async fn set(&self, req: v1::SetRequest) -> Result<v1::SetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let condition = req.condition();
        let (status, version) = self.state.write().await.set(
            key,
            req.value,
            condition,
            req.version,
            Expire::from_wire(req.expire),
            Instant::now(),
        );
        if status {
            self.notify();
        }
        tracing::debug!(key = %Key::from(key), version, status, "set");
        Ok(v1::SetResponse { status, version })
    }

    /// Waits until the key's version differs from `req.version`.
    pub async fn listen(&self, req: v1::ListenRequest) -> Result<v1::ListenResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let deadline = (req.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(req.timeout_ms as u64));
        // Subscribe before the first read so no change slips in between.
        let mut changes = self.changes.subscribe();
        loop {
            let (version, value) = self.state.read().await.get(key, Instant::now());
            if version != req.version {
                return Ok(v1::ListenResponse { version, value });
            }
            let changed = match deadline {
                Some(at) => tokio::time::timeout_at(at, changes.changed())
                    .await
                    .map_err(|_| KvError::Timeout)?,
                None => changes.changed().await,
            };
            changed.map_err(|_| KvError::Status { code: qkv_types::code::UNEXPECTED_ERROR })?;
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub async fn create_transaction(
        &self,
        _req: v1::CreateTransactionRequest,
    ) -> Result<v1::CreateTransactionResponse, KvError> {
        let index = self.state.write().await.create_tx(Instant::now());
        tracing::info!(index, lease_ms = self.config.lease_ms, "transaction opened");
        Ok(v1::CreateTransactionResponse { index })
    }

    pub async fn commit(
        &self,
        req: v1::CommitTransactionRequest,
    ) -> Result<v1::CommitTransactionResponse, KvError> {
        let applied = self.state.write().await.commit(req.index, Instant::now())?;
        if applied > 0 {
            self.notify();
        }
        tracing::info!(index = req.index, applied, "transaction committed");
        Ok(v1::CommitTransactionResponse {})
    }

    pub async fn rollback(
        &self,
        req: v1::RollbackTransactionRequest,
    ) -> Result<v1::RollbackTransactionResponse, KvError> {
        self.state.write().await.rollback(req.index, Instant::now())?;
        tracing::info!(index = req.index, "transaction rolled back");
        Ok(v1::RollbackTransactionResponse {})
    }

    pub async fn keep_alive(
        &self,
        req: v1::KeepAliveRequest,
    ) -> Result<v1::KeepAliveResponse, KvError> {
        self.state.write().await.keep_alive(req.index, Instant::now())?;
        Ok(v1::KeepAliveResponse {})
    }

    pub async fn transact_get(
        &self,
        req: v1::TransactGetRequest,
    ) -> Result<v1::TransactGetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let (version, value) = self.state.read().await.tx_get(req.index, key, Instant::now())?;
        Ok(v1::TransactGetResponse { version, value })
    }

    pub async fn transact_set(
        &self,
        req: v1::TransactSetRequest,
    ) -> Result<v1::TransactSetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let key = non_empty(&req.key, "key")?;
        let expected = req.cas.then_some(req.version);
        let (status, version) = self.state.write().await.stage(
            req.index,
            Slot::Kv(key.to_vec()),
            req.value,
            expected,
            Instant::now(),
        )?;
        Ok(v1::TransactSetResponse { status, version })
    }

    // -----------------------------------------------------------------------
    // Trees
    // -----------------------------------------------------------------------

    pub async fn tree_get(&self, req: v1::TreeGetRequest) -> Result<v1::TreeGetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let tree = non_empty(&req.tree, "tree name")?;
        let key = non_empty(&req.key, "key")?;
        let value = self
            .state
            .read()
            .await
            .tree_get(tree, key, req.transaction, Instant::now())?;
        Ok(v1::TreeGetResponse { value })
    }

    pub async fn tree_find(&self, req: v1::TreeFindRequest) -> Result<v1::TreeFindResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let tree = non_empty(&req.tree, "tree name")?;
        let key = non_empty(&req.key, "key")?;
        let value = self
            .state
            .read()
            .await
            .tree_get(tree, key, req.transaction, Instant::now())?;
        Ok(v1::TreeFindResponse { value, node: tree::encode_node(key) })
    }

    pub async fn tree_set(&self, req: v1::TreeSetRequest) -> Result<v1::TreeSetResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let tree = non_empty(&req.tree, "tree name")?;
        let key = non_empty(&req.key, "key")?;
        self.state
            .write()
            .await
            .tree_set(tree, key, req.value, req.transaction, Instant::now())?;
        if req.transaction == 0 {
            self.notify();
        }
        Ok(v1::TreeSetResponse { node: tree::encode_node(key) })
    }

    pub async fn tree_next(&self, req: v1::TreeNextRequest) -> Result<v1::TreeStepResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let name = non_empty(&req.tree, "tree name")?;
        let anchor = tree::anchor(&req.node, &req.key)?;
        let found = self
            .state
            .read()
            .await
            .tree_step(name, req.transaction, &anchor, true, Instant::now())?;
        Ok(step_response(found))
    }

    pub async fn tree_prev(&self, req: v1::TreePrevRequest) -> Result<v1::TreeStepResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let name = non_empty(&req.tree, "tree name")?;
        let anchor = tree::anchor(&req.node, &req.key)?;
        let found = self
            .state
            .read()
            .await
            .tree_step(name, req.transaction, &anchor, false, Instant::now())?;
        Ok(step_response(found))
    }

    pub async fn tree_range(
        &self,
        req: v1::TreeRangeRequest,
    ) -> Result<v1::TreeRangeResponse, KvError> {
        quorum(req.replicas.as_ref())?;
        let name = non_empty(&req.tree, "tree name")?;
        let limit = if req.limit == 0 { self.config.default_range_limit } else { req.limit } as usize;
        let entries = self.state.read().await.tree_range(
            name,
            req.transaction,
            req.first_key.as_deref(),
            req.last_key.as_deref(),
            limit,
            Instant::now(),
        )?;
        Ok(v1::TreeRangeResponse { entries })
    }

    // -----------------------------------------------------------------------
    // Framing
    // -----------------------------------------------------------------------

    /// Decodes an envelope, runs the request and encodes the reply.
    pub async fn handle(&self, envelope: Envelope) -> Result<Envelope, KvError> {
        let kind = envelope.request_kind()?;
        let reply = match kind {
            RequestKind::Get => Envelope::reply(kind, &self.get(envelope.decode_as()?).await?),
            RequestKind::GetVersion => {
                Envelope::reply(kind, &self.get_version(envelope.decode_as()?).await?)
            }
            RequestKind::Set => Envelope::reply(kind, &self.set(envelope.decode_as()?).await?),
            RequestKind::Listen => Envelope::reply(kind, &self.listen(envelope.decode_as()?).await?),
            RequestKind::CreateTransaction => {
                Envelope::reply(kind, &self.create_transaction(envelope.decode_as()?).await?)
            }
            RequestKind::CommitTransaction => {
                Envelope::reply(kind, &self.commit(envelope.decode_as()?).await?)
            }
            RequestKind::RollbackTransaction => {
                Envelope::reply(kind, &self.rollback(envelope.decode_as()?).await?)
            }
            RequestKind::KeepAlive => {
                Envelope::reply(kind, &self.keep_alive(envelope.decode_as()?).await?)
            }
            RequestKind::TransactGet => {
                Envelope::reply(kind, &self.transact_get(envelope.decode_as()?).await?)
            }
            RequestKind::TransactSet => {
                Envelope::reply(kind, &self.transact_set(envelope.decode_as()?).await?)
            }
            RequestKind::TreeGet => Envelope::reply(kind, &self.tree_get(envelope.decode_as()?).await?),
            RequestKind::TreeFind => {
                Envelope::reply(kind, &self.tree_find(envelope.decode_as()?).await?)
            }
            RequestKind::TreeSet => Envelope::reply(kind, &self.tree_set(envelope.decode_as()?).await?),
            RequestKind::TreeNext => {
                Envelope::reply(kind, &self.tree_next(envelope.decode_as()?).await?)
            }
            RequestKind::TreePrev => {
                Envelope::reply(kind, &self.tree_prev(envelope.decode_as()?).await?)
            }
            RequestKind::TreeRange => {
                Envelope::reply(kind, &self.tree_range(envelope.decode_as()?).await?)
            }
        };
        Ok(reply)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn step_response(found: Option<(Vec<u8>, Option<Vec<u8>>)>) -> v1::TreeStepResponse {
    match found {
        Some((key, value)) => v1::TreeStepResponse {
            node: tree::encode_node(&key),
            key: Some(key),
            value,
        },
        None => v1::TreeStepResponse::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    fn replicas() -> Option<v1::Replicas> {
        Some(Quorum::default().into())
    }

    fn set_req(key: &str, value: &str) -> v1::SetRequest {
        v1::SetRequest {
            replicas: replicas(),
            key: key.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn set_then_get() {
        let store = MemStore::default();
        let resp = store.set(set_req("k1", "v1")).await.unwrap();
        assert!(resp.status);
        assert_eq!(resp.version, 1);

        let got = store
            .get(v1::GetRequest { replicas: replicas(), key: b"k1".to_vec() })
            .await
            .unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.value.as_deref(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let store = MemStore::default();
        let err = store.get(v1::GetRequest { replicas: replicas(), key: vec![] }).await;
        assert!(matches!(err, Err(KvError::InvalidArgument(_))));
        let err = store
            .get(v1::GetRequest {
                replicas: Some(v1::Replicas { n: 1, r: 3, w: 1 }),
                key: b"k".to_vec(),
            })
            .await;
        assert!(matches!(err, Err(KvError::InvalidArgument(_))));
        let err = store.get(v1::GetRequest { replicas: None, key: b"k".to_vec() }).await;
        assert!(matches!(err, Err(KvError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn listen_wakes_on_write() {
        let store = Arc::new(MemStore::default());
        store.set(set_req("k", "a")).await.unwrap();

        let listener = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .listen(v1::ListenRequest {
                        replicas: replicas(),
                        key: b"k".to_vec(),
                        version: 1,
                        timeout_ms: 0,
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!listener.is_finished());

        store.set(set_req("k", "b")).await.unwrap();
        let resp = listener.await.unwrap().unwrap();
        assert_eq!(resp.version, 2);
        assert_eq!(resp.value.as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn listen_returns_immediately_on_stale_version() {
        let store = MemStore::default();
        store.set(set_req("k", "a")).await.unwrap();
        let resp = store
            .listen(v1::ListenRequest {
                replicas: replicas(),
                key: b"k".to_vec(),
                version: 0,
                timeout_ms: 0,
            })
            .await
            .unwrap();
        assert_eq!(resp.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listen_times_out() {
        let store = MemStore::default();
        let err = store
            .listen(v1::ListenRequest {
                replicas: replicas(),
                key: b"quiet".to_vec(),
                version: 0,
                timeout_ms: 500,
            })
            .await;
        assert_eq!(err, Err(KvError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_keep_alive() {
        let store = MemStore::new(StoreConfig { lease_ms: 1_000, ..Default::default() });
        let index = store
            .create_transaction(v1::CreateTransactionRequest {})
            .await
            .unwrap()
            .index;

        tokio::time::sleep(Duration::from_millis(800)).await;
        store.keep_alive(v1::KeepAliveRequest { index }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        store.keep_alive(v1::KeepAliveRequest { index }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let err = store.commit(v1::CommitTransactionRequest { index }).await;
        assert_eq!(err, Err(KvError::TransactionInterrupted { index }));
    }

    #[tokio::test]
    async fn handle_routes_by_kind() {
        let store = MemStore::default();
        let env = Envelope::for_request(&set_req("k", "v"));
        let reply = store.handle(env).await.unwrap();
        assert_eq!(reply.request_kind().unwrap(), RequestKind::Set);
        let resp: v1::SetResponse = reply.decode_as().unwrap();
        assert!(resp.status);

        let bogus = Envelope { kind: 0x7f, payload: vec![] };
        assert!(store.handle(bogus).await.is_err());
    }

    #[tokio::test]
    async fn tree_cursor_walk() {
        let store = MemStore::default();
        for k in ["b", "d", "a", "c"] {
            store
                .tree_set(v1::TreeSetRequest {
                    replicas: replicas(),
                    tree: b"t".to_vec(),
                    key: k.into(),
                    value: Some(k.to_uppercase().into_bytes()),
                    transaction: 0,
                })
                .await
                .unwrap();
        }

        let found = store
            .tree_find(v1::TreeFindRequest {
                replicas: replicas(),
                tree: b"t".to_vec(),
                key: b"b".to_vec(),
                transaction: 0,
            })
            .await
            .unwrap();
        assert_eq!(found.value.as_deref(), Some(&b"B"[..]));

        let mut node = found.node;
        let mut seen = Vec::new();
        loop {
            let step = store
                .tree_next(v1::TreeNextRequest {
                    replicas: replicas(),
                    tree: b"t".to_vec(),
                    key: b"b".to_vec(),
                    node: node.clone(),
                    transaction: 0,
                })
                .await
                .unwrap();
            match step.key {
                Some(k) => {
                    seen.push(k);
                    node = step.node;
                }
                None => break,
            }
        }
        assert_eq!(seen, vec![b"c".to_vec(), b"d".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn large_tree_reads_run_side_by_side() {
        let store = Arc::new(MemStore::default());
        for i in 0..10_000u32 {
            store
                .tree_set(v1::TreeSetRequest {
                    replicas: replicas(),
                    tree: b"big".to_vec(),
                    key: format!("{i:05}").into_bytes(),
                    value: Some(i.to_be_bytes().to_vec()),
                    transaction: 0,
                })
                .await
                .unwrap();
        }
        let tx = store.create_transaction(v1::CreateTransactionRequest {}).await.unwrap().index;
        store
            .tree_set(v1::TreeSetRequest {
                replicas: replicas(),
                tree: b"big".to_vec(),
                key: b"05000x".to_vec(),
                value: Some(b"staged".to_vec()),
                transaction: tx,
            })
            .await
            .unwrap();

        let mut readers = Vec::new();
        for reader in 0..8u64 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                let transaction = if reader % 2 == 0 { 0 } else { tx };
                let range = store
                    .tree_range(v1::TreeRangeRequest {
                        replicas: replicas(),
                        tree: b"big".to_vec(),
                        first_key: Some(b"05000".to_vec()),
                        last_key: None,
                        limit: 3,
                        transaction,
                    })
                    .await
                    .unwrap();
                let prev = store
                    .tree_prev(v1::TreePrevRequest {
                        replicas: replicas(),
                        tree: b"big".to_vec(),
                        key: b"zzzzz".to_vec(),
                        node: Vec::new(),
                        transaction,
                    })
                    .await
                    .unwrap();
                (transaction, range.entries, prev.key)
            }));
        }
        for reader in readers {
            let (transaction, entries, last) = reader.await.unwrap();
            let keys: Vec<_> = entries.into_iter().map(|e| e.key).collect();
            if transaction == 0 {
                assert_eq!(keys, vec![b"05000".to_vec(), b"05001".to_vec(), b"05002".to_vec()]);
            } else {
                assert_eq!(keys, vec![b"05000".to_vec(), b"05000x".to_vec(), b"05001".to_vec()]);
            }
            assert_eq!(last, Some(b"09999".to_vec()));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_writers_get_distinct_versions() {
        let store = Arc::new(MemStore::default());
        let (send, mut recv) = mpsc::unbounded_channel();
        for _ in 0..200 {
            let send = send.clone();
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 20)).await;
                let resp = store.set(set_req("hot", "x")).await.unwrap();
                let _ = send.send(resp.version);
            });
        }
        drop(send);
        let mut versions = Vec::new();
        while let Some(v) = recv.recv().await {
            versions.push(v);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=200).collect::<Vec<u64>>());
    }
}
