//! Identifier generation.

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a 24-char lowercase hex id: 4 bytes of big-endian unix seconds
/// followed by 8 cryptographically random bytes. Ids sort lexicographically
/// by creation time at one-second granularity.
pub fn generate_id() -> String {
    let mut b = [0u8; 12];
    let ts = Utc::now().timestamp() as u32;
    b[..4].copy_from_slice(&ts.to_be_bytes());
    OsRng.fill_bytes(&mut b[4..]);

    let mut out = String::with_capacity(24);
    for byte in b {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let id = generate_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_time_prefix_sorts() {
        // Two ids generated in the same process share the second-granular
        // prefix or the later one sorts after.
        let a = generate_id();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let b = generate_id();
        assert!(b[..8] >= a[..8]);
    }
}
