//! Notification channel names derived from task IDs.
//!
//! Task IDs are untrusted input and LISTEN/NOTIFY channel names cannot be
//! bound as parameters, so no raw bytes may ever reach the channel-name
//! position. Two paths: IDs made of `[A-Za-z0-9_.\-]` are normalized in
//! place (`-` and `.` become `_`, a `t_` prefix guards a leading digit);
//! anything else is replaced by the first 16 hex characters of its SHA-256.
//! Whatever comes out must still pass [`is_valid_channel`] before use.

use sha2::{Digest, Sha256};

use conveyor_core::StoreError;

/// PostgreSQL identifier limit.
const MAX_CHANNEL_LEN: usize = 63;

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn hashed(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    format!("h_{}", &hex::encode(digest)[..16])
}

/// Sanitize a raw task ID into channel-name-safe form.
pub fn sanitize_task_id(task_id: &str) -> String {
    if !is_safe_id(task_id) {
        return hashed(task_id);
    }
    let mut sanitized: String = task_id
        .chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect();
    if sanitized
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
    {
        sanitized.insert_str(0, "t_");
    }
    sanitized
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes. Nothing else may be passed
/// to LISTEN.
pub fn is_valid_channel(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CHANNEL_LEN {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Compose the channel for a task under the configured prefix. IDs whose
/// sanitized form would overflow the identifier limit fall back to the
/// hashed form; a prefix that cannot produce a valid channel is rejected.
pub fn channel_for(prefix: &str, task_id: &str) -> Result<String, StoreError> {
    let candidate = format!("{}_{}", prefix, sanitize_task_id(task_id));
    if is_valid_channel(&candidate) {
        return Ok(candidate);
    }
    let fallback = format!("{}_{}", prefix, hashed(task_id));
    if is_valid_channel(&fallback) {
        return Ok(fallback);
    }
    Err(StoreError::Other(anyhow::anyhow!(
        "notify channel prefix \"{}\" cannot form a valid channel name",
        prefix
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_ids_are_normalized_in_place() {
        assert_eq!(sanitize_task_id("my-task.id"), "my_task_id");
        assert_eq!(sanitize_task_id("simple_id"), "simple_id");
        assert_eq!(
            sanitize_task_id("0a1b2c3d-e4f5-6789-abcd-ef0123456789"),
            "t_0a1b2c3d_e4f5_6789_abcd_ef0123456789"
        );
    }

    #[test]
    fn leading_digit_gets_a_prefix() {
        assert_eq!(sanitize_task_id("123abc"), "t_123abc");
        assert!(sanitize_task_id("abc123").starts_with("abc"));
    }

    #[test]
    fn unsafe_ids_are_hashed() {
        let sanitized = sanitize_task_id("task id with spaces!");
        assert!(sanitized.starts_with("h_"));
        assert_eq!(sanitized.len(), 18);
        assert!(sanitized[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            sanitized.to_lowercase(),
            sanitized,
            "hash path must be lowercase"
        );

        // Injection attempts never survive in raw form.
        let hostile = sanitize_task_id("x; SELECT pg_sleep(10); --");
        assert!(hostile.starts_with("h_"));
        assert!(is_valid_channel(&hostile));
    }

    #[test]
    fn hashing_is_deterministic_and_distinct() {
        assert_eq!(sanitize_task_id("täsk"), sanitize_task_id("täsk"));
        assert_ne!(sanitize_task_id("täsk"), sanitize_task_id("tásk"));
    }

    #[test]
    fn channel_validation() {
        assert!(is_valid_channel("conveyor_result_t_123"));
        assert!(is_valid_channel("_leading_underscore"));
        assert!(!is_valid_channel(""));
        assert!(!is_valid_channel("1starts_with_digit"));
        assert!(!is_valid_channel("has-dash"));
        assert!(!is_valid_channel("has space"));
        assert!(!is_valid_channel(&"x".repeat(64)));
        assert!(is_valid_channel(&"x".repeat(63)));
    }

    #[test]
    fn channel_for_falls_back_to_hash_on_overflow() {
        let long_id = "a".repeat(80);
        let channel = channel_for("conveyor_result", &long_id).unwrap();
        assert!(is_valid_channel(&channel));
        assert!(channel.starts_with("conveyor_result_h_"));
    }

    #[test]
    fn channel_for_rejects_hostile_prefix() {
        assert!(channel_for(&"p".repeat(80), "task").is_err());
    }

    #[test]
    fn channel_for_uuid_ids() {
        let channel =
            channel_for("conveyor_result", "0a1b2c3d-e4f5-6789-abcd-ef0123456789").unwrap();
        assert_eq!(
            channel,
            "conveyor_result_t_0a1b2c3d_e4f5_6789_abcd_ef0123456789"
        );
        assert!(is_valid_channel(&channel));
    }
}
