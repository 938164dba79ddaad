//! Maps per-object transfer errors to stable [`ErrorCode`]s.

use bucket_mover_migrate_models::ErrorCode;
use bucket_mover_storage::StorageError;

use crate::TransferError;

/// Classifies a failed transfer.
///
/// Typed errors decide first. Wrapped SDK errors are classified by their
/// message.
#[must_use]
pub fn classify(error: &TransferError) -> ErrorCode {
    match error {
        TransferError::Storage(source) => classify_storage(source).unwrap_or_else(|| {
            if matches!(source, StorageError::Initiate { .. } | StorageError::MissingUploadId { .. })
            {
                ErrorCode::ChunkedTransfer
            } else {
                classify_message(&source.to_string())
            }
        }),
        TransferError::PartExhausted { source, .. } | TransferError::Complete { source, .. } => {
            match classify_storage(source) {
                Some(ErrorCode::ClientClosed) => ErrorCode::ClientClosed,
                _ => ErrorCode::ChunkedTransfer,
            }
        }
        TransferError::TooManyParts { .. } => ErrorCode::ChunkedTransfer,
    }
}

const fn classify_storage(error: &StorageError) -> Option<ErrorCode> {
    match error {
        StorageError::Closed => Some(ErrorCode::ClientClosed),
        StorageError::NotFound { .. } => Some(ErrorCode::SourceNotFound),
        _ => None,
    }
}

/// Classifies an error by the service codes and transport phrases that
/// appear in its message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["nosuchbucket"]) {
        ErrorCode::BucketNotFound
    } else if has(&["nosuchkey", "not found", "404"]) {
        ErrorCode::SourceNotFound
    } else if has(&[
        "accessdenied",
        "access denied",
        "invalidaccesskeyid",
        "signaturedoesnotmatch",
        "403",
    ]) {
        ErrorCode::AccessDenied
    } else if has(&["timed out", "timeout"]) {
        ErrorCode::Timeout
    } else if has(&[
        "dispatch failure",
        "connection",
        "broken pipe",
        "dns error",
        "io error",
    ]) {
        ErrorCode::Network
    } else {
        ErrorCode::Unknown
    }
}
