//! Ordered trees addressed by name, and cursors that walk them.

use qkv_proto::v1;
use qkv_types::{decode_optional, encode_optional, Key, KvError, Quorum, TransactionIndex, Value};

use crate::client::ContextClient;
use crate::transaction::{Binding, Transaction};

impl ContextClient {
    pub fn tree(&self, name: impl Into<Key>, quorum: Quorum) -> Tree {
        Tree {
            client: self.clone(),
            name: name.into(),
            quorum,
        }
    }
}

fn bind(transaction: Option<&Transaction>) -> Option<Binding> {
    transaction.map(|t| t.binding().clone())
}

fn index_of(binding: Option<&Binding>) -> Result<TransactionIndex, KvError> {
    binding.map_or(Ok(0), Binding::active_index)
}

#[derive(Clone)]
pub struct Tree {
    client: ContextClient,
    name: Key,
    quorum: Quorum,
}

impl Tree {
    pub fn name(&self) -> &Key {
        &self.name
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    /// Value stored at exactly `key`. The returned cursor is not positioned.
    pub async fn get<T: Value>(
        &self,
        key: impl Into<Key>,
        transaction: Option<&Transaction>,
    ) -> Result<Cursor<T>, KvError> {
        let mut cursor = self.cursor(key, transaction);
        let resp = self
            .client
            .request(v1::TreeGetRequest {
                replicas: Some(self.quorum.into()),
                tree: self.name.as_bytes().to_vec(),
                key: cursor.key.as_bytes().to_vec(),
                transaction: index_of(cursor.transaction.as_ref())?,
            })
            .await?;
        cursor.value = decode_optional(resp.value.as_deref())?;
        Ok(cursor)
    }

    /// Positions a cursor at `key`. The value is set only on an exact match;
    /// `next`/`prev` continue from the returned position either way.
    pub async fn find<T: Value>(
        &self,
        key: impl Into<Key>,
        transaction: Option<&Transaction>,
    ) -> Result<Cursor<T>, KvError> {
        let mut cursor = self.cursor(key, transaction);
        let resp = self
            .client
            .request(v1::TreeFindRequest {
                replicas: Some(self.quorum.into()),
                tree: self.name.as_bytes().to_vec(),
                key: cursor.key.as_bytes().to_vec(),
                transaction: index_of(cursor.transaction.as_ref())?,
            })
            .await?;
        cursor.value = decode_optional(resp.value.as_deref())?;
        cursor.node = resp.node;
        Ok(cursor)
    }

    /// Local cursor at `key` with no value and no position. No request is
    /// sent.
    pub fn cursor<T: Value>(&self, key: impl Into<Key>, transaction: Option<&Transaction>) -> Cursor<T> {
        Cursor {
            tree: self.clone(),
            key: key.into(),
            value: None,
            node: Vec::new(),
            transaction: bind(transaction),
        }
    }

    /// Entries with `first <= key < last` in key order, at most `limit` of
    /// them (`0` lets the store pick). Each result is a snapshot cursor with
    /// no position; `find` it again to step from there.
    pub async fn range<T: Value>(
        &self,
        first: Option<Key>,
        last: Option<Key>,
        limit: u32,
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Cursor<T>>, KvError> {
        let binding = bind(transaction);
        let resp = self
            .client
            .request(v1::TreeRangeRequest {
                replicas: Some(self.quorum.into()),
                tree: self.name.as_bytes().to_vec(),
                first_key: first.map(Key::into_bytes),
                last_key: last.map(Key::into_bytes),
                limit,
                transaction: index_of(binding.as_ref())?,
            })
            .await?;
        resp.entries
            .into_iter()
            .map(|entry| {
                Ok(Cursor {
                    tree: self.clone(),
                    key: Key::from(entry.key),
                    value: decode_optional(entry.value.as_deref())?,
                    node: Vec::new(),
                    transaction: binding.clone(),
                })
            })
            .collect()
    }
}

/// Position in a tree: key, value and the store's continuation token.
pub struct Cursor<T> {
    tree: Tree,
    key: Key,
    value: Option<T>,
    node: Vec<u8>,
    transaction: Option<Binding>,
}

enum Direction {
    Next,
    Prev,
}

impl<T: Value> Cursor<T> {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Opaque continuation token; empty until the cursor is positioned.
    pub fn node(&self) -> &[u8] {
        &self.node
    }

    pub fn is_positioned(&self) -> bool {
        !self.node.is_empty()
    }

    /// Writes `value` at the cursor's key and takes the position the store
    /// returns.
    pub async fn set(&mut self, value: impl Into<Option<T>>) -> Result<(), KvError> {
        let value = value.into();
        let resp = self
            .tree
            .client
            .request(v1::TreeSetRequest {
                replicas: Some(self.tree.quorum.into()),
                tree: self.tree.name.as_bytes().to_vec(),
                key: self.key.as_bytes().to_vec(),
                value: encode_optional(value.as_ref())?,
                transaction: index_of(self.transaction.as_ref())?,
            })
            .await?;
        self.value = value;
        self.node = resp.node;
        Ok(())
    }

    /// Moves to the following entry. Returns `false`, leaving the cursor
    /// untouched, when there is none.
    pub async fn next(&mut self) -> Result<bool, KvError> {
        self.step(Direction::Next).await
    }

    /// Moves to the preceding entry. Returns `false`, leaving the cursor
    /// untouched, when there is none.
    pub async fn prev(&mut self) -> Result<bool, KvError> {
        self.step(Direction::Prev).await
    }

    async fn step(&mut self, direction: Direction) -> Result<bool, KvError> {
        let replicas = Some(self.tree.quorum.into());
        let tree = self.tree.name.as_bytes().to_vec();
        let key = self.key.as_bytes().to_vec();
        let node = self.node.clone();
        let transaction = index_of(self.transaction.as_ref())?;
        let resp = match direction {
            Direction::Next => {
                self.tree
                    .client
                    .request(v1::TreeNextRequest { replicas, tree, key, node, transaction })
                    .await?
            }
            Direction::Prev => {
                self.tree
                    .client
                    .request(v1::TreePrevRequest { replicas, tree, key, node, transaction })
                    .await?
            }
        };
        let Some(key) = resp.key else {
            return Ok(false);
        };
        self.value = decode_optional(resp.value.as_deref())?;
        self.key = Key::from(key);
        self.node = resp.node;
        Ok(true)
    }
}

impl<T: Value + std::fmt::Debug> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("tree", &self.tree.name)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("positioned", &self.is_positioned())
            .finish()
    }
}
