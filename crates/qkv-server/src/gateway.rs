use std::sync::Arc;

use qkv_proto::v1::{gateway_server::Gateway, Envelope};
use qkv_store::MemStore;
use tonic::{Request, Response, Status};

use crate::convert::kv_to_status;

pub struct GatewayImpl {
    store: Arc<MemStore>,
}

impl GatewayImpl {
    pub fn new(store: Arc<MemStore>) -> Self {
        GatewayImpl { store }
    }
}

#[tonic::async_trait]
impl Gateway for GatewayImpl {
    async fn dispatch(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
        let envelope = request.into_inner();
        let kind = envelope.kind;
        match self.store.handle(envelope).await {
            Ok(reply) => Ok(Response::new(reply)),
            Err(error) => {
                tracing::debug!(kind, %error, "request rejected");
                Err(kv_to_status(error))
            }
        }
    }
}
