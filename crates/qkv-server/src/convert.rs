use qkv_proto::STATUS_CODE_METADATA;
use qkv_types::KvError;
use tonic::metadata::MetadataValue;
use tonic::Status;

/// gRPC status for a store error. The store's numeric code always travels
/// in metadata so clients recover the exact variant.
pub fn kv_to_status(err: KvError) -> Status {
    let mut status = match &err {
        KvError::Timeout => Status::deadline_exceeded(err.to_string()),
        KvError::InvalidArgument(_) | KvError::Codec(_) => Status::invalid_argument(err.to_string()),
        KvError::TransactionNotFound { .. } => Status::not_found(err.to_string()),
        KvError::TransactionCompleted { .. } => Status::failed_precondition(err.to_string()),
        KvError::TransactionInterrupted { .. } => Status::aborted(err.to_string()),
        KvError::Status { .. } | KvError::Transport(_) | KvError::Closed | KvError::Disconnected => {
            Status::internal(err.to_string())
        }
    };
    if let Ok(val) = MetadataValue::try_from(err.code().to_string()) {
        status.metadata_mut().insert(STATUS_CODE_METADATA, val);
    }
    status
}
