use sha2::{Digest, Sha256};

/// Content fingerprint used for the short-window duplicate check.
///
/// The hash covers `(phone_number_id, message_content)` so identical text
/// arriving on different numbers is never suppressed.
pub fn content_fingerprint(phone_number_id: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phone_number_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Cache key under which a fingerprint is stored.
pub fn dedup_key(fingerprint: &str) -> String {
    format!("dedup:{}", fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let a = content_fingerprint("P1", "Hello");
        let b = content_fingerprint("P1", "Hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_separates_phone_ids() {
        assert_ne!(
            content_fingerprint("P1", "Hello"),
            content_fingerprint("P2", "Hello")
        );
    }

    #[test]
    fn delimiter_prevents_boundary_collisions() {
        assert_ne!(
            content_fingerprint("P1x", "Hello"),
            content_fingerprint("P1", "xHello")
        );
    }
}
