#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use qkv_client::{Address, ContextClient, Quorum, Registration, ResponseHandler, Transport};
use qkv_proto::v1::Envelope;
use qkv_proto::RequestKind;
use qkv_store::MemStore;

/// Delivers envelopes straight to an in-process store.
pub struct LoopbackTransport {
    store: Arc<MemStore>,
    sent: Mutex<Vec<(Address, RequestKind)>>,
}

impl LoopbackTransport {
    pub fn new(store: Arc<MemStore>) -> Arc<Self> {
        Arc::new(LoopbackTransport { store, sent: Mutex::new(Vec::new()) })
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.sent.lock().unwrap().iter().filter(|(_, k)| *k == kind).count()
    }

    pub fn targets(&self) -> Vec<Address> {
        self.sent.lock().unwrap().iter().map(|(a, _)| a.clone()).collect()
    }
}

impl Transport for LoopbackTransport {
    fn send_request(&self, to: &Address, request: Envelope, handler: ResponseHandler) -> Registration {
        if let Ok(kind) = request.request_kind() {
            self.sent.lock().unwrap().push((to.clone(), kind));
        }
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            match store.handle(request).await {
                Ok(response) => handler.success(response),
                Err(error) => handler.failure(error.code()),
            }
        });
        Registration::new(move || task.abort())
    }
}

pub fn quorum() -> Quorum {
    Quorum::new(3, 2, 2).unwrap()
}

pub fn address(i: usize) -> Address {
    format!("127.0.0.1:{}", 17400 + i).parse().unwrap()
}

pub fn client_with(store: Arc<MemStore>, endpoints: usize) -> (ContextClient, Arc<LoopbackTransport>) {
    let transport = LoopbackTransport::new(store);
    let client = ContextClient::new(
        transport.clone(),
        (0..endpoints).map(address).collect(),
        Duration::from_secs(5),
    )
    .unwrap();
    (client, transport)
}

pub fn client() -> (ContextClient, Arc<LoopbackTransport>) {
    client_with(Arc::new(MemStore::default()), 1)
}
