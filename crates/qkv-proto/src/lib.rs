//! Wire shapes for the quorum store.
//!
//! Every request travels inside an [`v1::Envelope`] whose `kind` is the
//! request's type code and whose payload is the prost encoding of the
//! message. The [`Request`] trait ties each request to its response type so
//! the client can allocate an empty response and merge the payload into it.

use prost::Message;
use qkv_types::{KvError, Quorum, TransactionIndex};

pub mod v1 {
    tonic::include_proto!("qkv.v1");
}

pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/descriptor.bin"));

/// gRPC metadata key carrying the store's numeric status code on failures.
pub const STATUS_CODE_METADATA: &str = "qkv-status-code";

/// Request type codes. Values are part of the wire contract.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get = 0x01,
    Set = 0x02,
    Listen = 0x03,
    CreateTransaction = 0x09,
    CommitTransaction = 0x0A,
    RollbackTransaction = 0x0B,
    KeepAlive = 0x0C,
    TransactSet = 0x0D,
    TransactGet = 0x0E,
    TreeGet = 0x0F,
    TreeSet = 0x10,
    TreeFind = 0x11,
    TreeNext = 0x12,
    TreePrev = 0x13,
    TreeRange = 0x14,
    GetVersion = 0x16,
}

impl TryFrom<u32> for RequestKind {
    type Error = KvError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        use RequestKind::*;
        Ok(match raw {
            0x01 => Get,
            0x02 => Set,
            0x03 => Listen,
            0x09 => CreateTransaction,
            0x0A => CommitTransaction,
            0x0B => RollbackTransaction,
            0x0C => KeepAlive,
            0x0D => TransactSet,
            0x0E => TransactGet,
            0x0F => TreeGet,
            0x10 => TreeSet,
            0x11 => TreeFind,
            0x12 => TreeNext,
            0x13 => TreePrev,
            0x14 => TreeRange,
            0x16 => GetVersion,
            other => {
                return Err(KvError::InvalidArgument(format!(
                    "unknown request kind {other:#04x}"
                )))
            }
        })
    }
}

/// A request message and the response it is answered with.
pub trait Request: Message + Default + Send + Sync + 'static {
    const KIND: RequestKind;
    type Response: Message + Default + Send + 'static;

    /// Transaction the request is scoped to, `0` for none. Used to attach
    /// the index to transaction status errors.
    fn transaction(&self) -> TransactionIndex {
        0
    }
}

macro_rules! request {
    ($kind:ident: $req:ident => $resp:ident) => {
        impl Request for v1::$req {
            const KIND: RequestKind = RequestKind::$kind;
            type Response = v1::$resp;
        }
    };
    ($kind:ident: $req:ident => $resp:ident, $field:ident) => {
        impl Request for v1::$req {
            const KIND: RequestKind = RequestKind::$kind;
            type Response = v1::$resp;

            fn transaction(&self) -> TransactionIndex {
                self.$field
            }
        }
    };
}

request!(Get: GetRequest => GetResponse);
request!(GetVersion: GetVersionRequest => GetVersionResponse);
request!(Set: SetRequest => SetResponse);
request!(Listen: ListenRequest => ListenResponse);

request!(CreateTransaction: CreateTransactionRequest => CreateTransactionResponse);
request!(CommitTransaction: CommitTransactionRequest => CommitTransactionResponse, index);
request!(RollbackTransaction: RollbackTransactionRequest => RollbackTransactionResponse, index);
request!(KeepAlive: KeepAliveRequest => KeepAliveResponse, index);
request!(TransactGet: TransactGetRequest => TransactGetResponse, index);
request!(TransactSet: TransactSetRequest => TransactSetResponse, index);

request!(TreeGet: TreeGetRequest => TreeGetResponse, transaction);
request!(TreeFind: TreeFindRequest => TreeFindResponse, transaction);
request!(TreeSet: TreeSetRequest => TreeSetResponse, transaction);
request!(TreeNext: TreeNextRequest => TreeStepResponse, transaction);
request!(TreePrev: TreePrevRequest => TreeStepResponse, transaction);
request!(TreeRange: TreeRangeRequest => TreeRangeResponse, transaction);

impl v1::Envelope {
    pub fn for_request<Q: Request>(request: &Q) -> Self {
        v1::Envelope {
            kind: Q::KIND as u32,
            payload: request.encode_to_vec(),
        }
    }

    pub fn reply<M: Message>(kind: RequestKind, response: &M) -> Self {
        v1::Envelope {
            kind: kind as u32,
            payload: response.encode_to_vec(),
        }
    }

    pub fn request_kind(&self) -> Result<RequestKind, KvError> {
        RequestKind::try_from(self.kind)
    }

    /// Allocate an empty `M` and merge the payload into it.
    pub fn decode_as<M: Message + Default>(&self) -> Result<M, KvError> {
        let mut message = M::default();
        message
            .merge(self.payload.as_slice())
            .map_err(|e| KvError::Codec(e.to_string()))?;
        Ok(message)
    }
}

impl From<Quorum> for v1::Replicas {
    fn from(q: Quorum) -> Self {
        v1::Replicas {
            n: q.n() as u32,
            r: q.r() as u32,
            w: q.w() as u32,
        }
    }
}

impl v1::Replicas {
    /// Listen only carries fan-out and write quorum.
    pub fn for_listen(q: Quorum) -> Self {
        v1::Replicas {
            n: q.n() as u32,
            r: 0,
            w: q.w() as u32,
        }
    }

    pub fn to_quorum(&self) -> Result<Quorum, KvError> {
        let narrow = |v: u32, name: &str| {
            u8::try_from(v).map_err(|_| KvError::InvalidArgument(format!("{name}={v} out of range")))
        };
        Quorum::new(narrow(self.n, "n")?, narrow(self.r, "r")?, narrow(self.w, "w")?)
    }
}
