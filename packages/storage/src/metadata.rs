//! Metadata translation between backend kinds.

use std::collections::BTreeMap;

use bucket_mover_storage_models::{BackendKind, ObjectMetadata};

/// Converts source metadata into the form the destination accepts.
///
/// Standard headers carry over unchanged. User metadata keys are
/// lowercased for OSS destinations. Entries that cannot be sent as an HTTP
/// header (empty or non-token keys, values with control or non-ASCII
/// characters) are dropped with a warning.
#[must_use]
pub fn translate_metadata(source: &ObjectMetadata, destination: BackendKind) -> ObjectMetadata {
    let mut user = BTreeMap::new();

    for (key, value) in &source.user {
        if !is_header_token(key) {
            log::warn!("Dropping user metadata with unsupported key {key:?}");
            continue;
        }
        if !is_header_value(value) {
            log::warn!("Dropping user metadata {key:?}: value is not a valid header value");
            continue;
        }

        let key = if destination == BackendKind::Oss {
            key.to_ascii_lowercase()
        } else {
            key.clone()
        };
        user.insert(key, value.clone());
    }

    ObjectMetadata {
        user,
        ..source.clone()
    }
}

fn is_header_token(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b' '..=b'~').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_user(entries: &[(&str, &str)]) -> ObjectMetadata {
        ObjectMetadata {
            content_type: Some("text/plain".to_string()),
            user: entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..ObjectMetadata::default()
        }
    }

    #[test]
    fn lowercases_user_keys_for_oss() {
        let translated = translate_metadata(&with_user(&[("Owner-Team", "infra")]), BackendKind::Oss);
        assert_eq!(translated.user.get("owner-team").map(String::as_str), Some("infra"));
        assert_eq!(translated.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn keeps_case_for_s3() {
        let translated = translate_metadata(&with_user(&[("Owner-Team", "infra")]), BackendKind::S3);
        assert!(translated.user.contains_key("Owner-Team"));
    }

    #[test]
    fn drops_entries_that_are_not_valid_headers() {
        let translated = translate_metadata(
            &with_user(&[("ok", "v"), ("bad key", "v"), ("", "v"), ("newline", "a\nb"), ("utf8", "caf\u{e9}")]),
            BackendKind::S3,
        );
        assert_eq!(translated.user.len(), 1);
        assert!(translated.user.contains_key("ok"));
    }
}
