//! Small helpers shared across the crate

use std::time::{SystemTime, UNIX_EPOCH};

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Unique, roughly time-ordered id: base36 millis, a dot, base36 randomness.
pub fn create_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let salt: u64 = rand::random();
    format!("{}.{}", base36(ms), base36(salt as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_ids_are_url_safe_and_unique() {
        let ids: HashSet<String> = (0..100).map(|_| create_id()).collect();
        assert_eq!(ids.len(), 100);
        for id in &ids {
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '.'));
        }
    }
}
