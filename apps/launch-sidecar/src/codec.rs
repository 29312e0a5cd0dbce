//! Link obfuscation layer.
//!
//! Every character of a frame is XOR-ed with a repeating 4-byte key indexed by
//! `position % 4`. The transform is its own inverse, so `decode` is `encode`.
//! This hides frames from casual listeners on the radio band; it is not
//! encryption.

use std::str::FromStr;

pub const DEFAULT_KEY: [u8; 4] = [0x2A, 0x4F, 0x31, 0x5C];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorCipher {
    key: [u8; 4],
}

impl XorCipher {
    pub const fn new(key: [u8; 4]) -> Self {
        Self { key }
    }

    pub fn encode(&self, plaintext: &str) -> String {
        plaintext
            .chars()
            .enumerate()
            .map(|(idx, ch)| {
                let mixed = u32::from(ch) ^ u32::from(self.key[idx % self.key.len()]);
                // Only the low byte changes, so a valid scalar stays valid.
                char::from_u32(mixed).unwrap_or(ch)
            })
            .collect()
    }

    pub fn decode(&self, ciphertext: &str) -> String {
        self.encode(ciphertext)
    }
}

impl Default for XorCipher {
    fn default() -> Self {
        Self::new(DEFAULT_KEY)
    }
}

/// Codec applied to every line crossing the radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCodec {
    Plain,
    Xor(XorCipher),
}

impl LinkCodec {
    pub fn encode(&self, plaintext: &str) -> String {
        match self {
            LinkCodec::Plain => plaintext.to_string(),
            LinkCodec::Xor(cipher) => cipher.encode(plaintext),
        }
    }

    pub fn decode(&self, ciphertext: &str) -> String {
        match self {
            LinkCodec::Plain => ciphertext.to_string(),
            LinkCodec::Xor(cipher) => cipher.decode(ciphertext),
        }
    }

    pub fn from_config(mode: &str, key: [u8; 4]) -> Result<Self, String> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "xor" => Ok(LinkCodec::Xor(XorCipher::new(key))),
            "none" | "plain" => Ok(LinkCodec::Plain),
            other => Err(format!("unknown link cipher {other:?} (expected xor or none)")),
        }
    }
}

/// Parses a key such as `0x2A,0x4F,0x31,0x5C` or `42,79,49,92`.
pub fn parse_key(raw: &str) -> Result<[u8; 4], String> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() != 4 {
        return Err(format!("cipher key needs 4 bytes, got {}", parts.len()));
    }
    let mut key = [0u8; 4];
    for (slot, part) in key.iter_mut().zip(parts) {
        let parsed = match part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
        {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => u8::from_str(part),
        };
        *slot = parsed.map_err(|err| format!("invalid cipher key byte {part:?}: {err}"))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_known_vector() {
        let cipher = XorCipher::default();
        // 'K' ^ 0x2A, '-' ^ 0x4F, '7' ^ 0x31, '*' ^ 0x5C, 'K' ^ 0x2A
        assert_eq!(cipher.encode("K-7*K"), "ab\u{6}va");
    }

    #[test]
    fn decode_inverts_encode_for_assorted_keys() {
        let keys = [DEFAULT_KEY, [0, 0, 0, 0], [0xFF, 0x01, 0x7F, 0x80], [1, 2, 3, 4]];
        let texts = [
            "",
            "K",
            "ADMIN*12*1712.5*22.1*55.0*6.2*-75.5*1200",
            "[ADMIN-3-launch][12.5][22.1][55.0]",
            "ADMIN-CANSAT_REQ_ID",
            "~!@#$%^&*()_+{}|:<>?",
        ];
        for key in keys {
            let cipher = XorCipher::new(key);
            for text in texts {
                assert_eq!(cipher.decode(&cipher.encode(text)), text, "key {key:?}");
            }
        }
    }

    #[test]
    fn non_ascii_text_survives_round_trip() {
        let cipher = XorCipher::default();
        let text = "señal 25°C";
        assert_eq!(cipher.decode(&cipher.encode(text)), text);
    }

    #[test]
    fn plain_codec_is_identity() {
        let codec = LinkCodec::Plain;
        assert_eq!(codec.encode("K*1*2.0"), "K*1*2.0");
        assert_eq!(codec.decode("K*1*2.0"), "K*1*2.0");
    }

    #[test]
    fn parse_key_accepts_hex_and_decimal() {
        assert_eq!(parse_key("0x2A, 0x4F,0x31,0x5C").unwrap(), DEFAULT_KEY);
        assert_eq!(parse_key("42,79,49,92").unwrap(), DEFAULT_KEY);
        assert!(parse_key("1,2,3").is_err());
        assert!(parse_key("1,2,3,300").is_err());
    }

    #[test]
    fn from_config_rejects_unknown_mode() {
        assert_eq!(
            LinkCodec::from_config("none", DEFAULT_KEY).unwrap(),
            LinkCodec::Plain
        );
        assert!(LinkCodec::from_config("aes", DEFAULT_KEY).is_err());
    }
}
