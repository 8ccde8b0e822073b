mod convert;
mod gateway;

use std::net::SocketAddr;
use std::sync::Arc;

use qkv_proto::v1::gateway_server::GatewayServer;
use qkv_store::MemStore;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use convert::kv_to_status;
pub use gateway::GatewayImpl;

fn router(store: Arc<MemStore>) -> Router {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(qkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tonic::transport::Server::builder()
        .add_service(GatewayServer::new(GatewayImpl::new(store)))
        .add_service(reflection)
}

pub async fn serve(addr: SocketAddr, store: Arc<MemStore>) -> anyhow::Result<()> {
    tracing::info!(%addr, "gateway gRPC server starting");
    router(store).serve(addr).await.map_err(Into::into)
}

/// Serves on an already bound listener (ephemeral ports in tests).
pub async fn serve_listener(listener: TcpListener, store: Arc<MemStore>) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "gateway gRPC server starting");
    router(store)
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(Into::into)
}
