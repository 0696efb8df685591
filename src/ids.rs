//! Correlation id generation.

use rand::RngCore;

/// Generates a fresh correlation id: 3 random bytes rendered as 6 hex
/// characters, which is sufficient for uniquely identifying an in-flight
/// request or long-lived subscription within the process. A v4 UUID would
/// work equally well; hex bytes keep the dependency footprint smaller since
/// nothing else in this crate needs a UUID type.
pub fn generate_correlation_id() -> String {
    let mut bytes = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_six_hex_chars() {
        let id = generate_correlation_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_not_trivially_constant() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        // Not a strict uniqueness guarantee, but catches a broken RNG.
        assert_ne!(a, b, "two consecutive ids collided, RNG is likely broken");
    }
}
