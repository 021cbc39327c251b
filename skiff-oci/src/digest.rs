//! Content digests in `sha256:<hex>` form.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// Length of a lowercase hex-encoded SHA-256 digest.
const HEX_LEN: usize = 64;

/// A validated `sha256:<64 lowercase hex>` content digest.
///
/// The hex part doubles as the blob file name in content stores, so the
/// invariant `SHA256(bytes) == digest` is what ties file names to file
/// contents everywhere in this workspace.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parses a digest string, accepting only `sha256:` with 64 lowercase
    /// hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported digest: {value}")))?;
        if !is_hex(hex) {
            return Err(Error::InvalidArgument(format!("malformed digest: {value}")));
        }
        Ok(Self {
            hex: hex.to_owned(),
        })
    }

    /// Computes the digest of a byte slice.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Computes the digest of everything `reader` yields.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            hex: hex::encode(hasher.finalize()),
        })
    }

    /// Wraps a raw hex string that is already known to be a digest.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if !is_hex(hex) {
            return Err(Error::InvalidArgument(format!("malformed digest hex: {hex}")));
        }
        Ok(Self {
            hex: hex.to_owned(),
        })
    }

    /// The digest algorithm. Always `sha256` in this system.
    pub fn algorithm(&self) -> &'static str {
        "sha256"
    }

    /// The 64-character lowercase hex part.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

/// Returns `true` if `s` is exactly 64 lowercase hex characters.
pub(crate) fn is_hex(s: &str) -> bool {
    s.len() == HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Writer that computes SHA-256 while forwarding data to an inner writer.
#[derive(Debug)]
pub struct DigestWriter<W> {
    writer: W,
    hasher: Sha256,
    written: u64,
}

impl<W> DigestWriter<W> {
    /// Wraps `writer`, hashing every byte that passes through.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consumes the writer and returns the digest of everything written.
    pub fn finish(self) -> (W, Digest) {
        let digest = Digest {
            hex: hex::encode(self.hasher.finalize()),
        };
        (self.writer, digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_known_value() {
        // sha256("hello")
        let d = Digest::compute(b"hello");
        assert_eq!(
            d.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            d.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn parse_roundtrip() {
        let s = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let d = Digest::parse(s).unwrap();
        assert_eq!(d.to_string(), s);
    }

    #[test]
    fn rejects_bad_algorithm() {
        assert!(Digest::parse("sha512:abcd").is_err());
        assert!(Digest::parse("2cf24dba").is_err());
    }

    #[test]
    fn rejects_bad_hex() {
        // uppercase
        assert!(
            Digest::parse(
                "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824"
            )
            .is_err()
        );
        // short
        assert!(Digest::parse("sha256:2cf24dba").is_err());
        // non-hex char
        assert!(
            Digest::parse(
                "sha256:zzf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            )
            .is_err()
        );
    }

    #[test]
    fn from_reader_matches_compute() {
        let data = vec![7u8; 200_000];
        let a = Digest::compute(&data);
        let b = Digest::from_reader(data.as_slice()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn writer_hashes_passthrough() {
        let mut w = DigestWriter::new(Vec::new());
        w.write_all(b"he").unwrap();
        w.write_all(b"llo").unwrap();
        assert_eq!(w.written(), 5);
        let (inner, digest) = w.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(digest, Digest::compute(b"hello"));
    }

    #[test]
    fn serde_string_form() {
        let s = "\"sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\"";
        let d: Digest = serde_json::from_str(s).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), s);
        let bad: std::result::Result<Digest, _> = serde_json::from_str("\"sha256:xyz\"");
        assert!(bad.is_err());
    }
}
