use eyre::{eyre, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;

const PERIOD: u64 = 30;
const DIGITS: u32 = 6;

/// Six-digit RFC 6238 code for `secret` (base32, spaces tolerated) at the
/// given unix time.
pub fn code_at(secret: &str, unix: u64) -> Result<String> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let key = base32::decode(base32::Alphabet::RFC4648 { padding: false }, &cleaned)
        .ok_or_else(|| eyre!("totp secret is not valid base32"))?;
    if key.is_empty() {
        return Err(eyre!("totp secret is empty"));
    }

    let counter = unix / PERIOD;
    let mut mac = Hmac::<Sha1>::new_from_slice(&key)
        .map_err(|e| eyre!("totp key rejected by hmac: {e}"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[19] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    Ok(format!("{:06}", bin % 10u32.pow(DIGITS)))
}

/// Seconds left in the current 30 s window. A handler that sees a short
/// remainder waits it out and generates a fresh code instead of racing the
/// window edge.
pub fn seconds_remaining(unix: u64) -> u64 {
    PERIOD - unix % PERIOD
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B vectors, SHA-1, truncated to six digits.
    // Secret is ASCII "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_vectors() {
        for (unix, expect) in [
            (59u64, "287082"),
            (1111111109, "081804"),
            (1111111111, "050471"),
            (1234567890, "005924"),
            (2000000000, "279037"),
            (20000000000, "353130"),
        ] {
            assert_eq!(code_at(RFC_SECRET, unix).unwrap(), expect, "t={unix}");
        }
    }

    #[test]
    fn tolerates_spaces_and_lowercase() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq";
        assert_eq!(code_at(spaced, 59).unwrap(), "287082");
    }

    #[test]
    fn rejects_bad_secrets() {
        assert!(code_at("not!base32", 59).is_err());
        assert!(code_at("", 59).is_err());
    }

    #[test]
    fn window_remainder() {
        assert_eq!(seconds_remaining(0), 30);
        assert_eq!(seconds_remaining(59), 1);
        assert_eq!(seconds_remaining(26), 4);
        // Same code throughout one window, new code after it.
        let a = code_at(RFC_SECRET, 30).unwrap();
        let b = code_at(RFC_SECRET, 59).unwrap();
        let c = code_at(RFC_SECRET, 60).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
