//! OCI image reference parsing and normalization.
//!
//! Handles Docker-style references:
//! - `alpine` → path `alpine`, tag `latest` after normalization
//! - `docker.io/alpine` → path `library/alpine`, tag `latest`
//! - `ghcr.io/org/app:v1` → domain `ghcr.io`, path `org/app`, tag `v1`
//! - `alpine@sha256:<hex>` → digest-pinned reference

use std::fmt;

use crate::digest::is_hex;
use crate::{Digest, Error, Result};

/// Longest accepted reference string.
const MAX_REFERENCE_LEN: usize = 255;
/// Longest accepted repository path.
const MAX_PATH_LEN: usize = 127;
/// Longest accepted tag.
const MAX_TAG_LEN: usize = 128;

const DOCKER_DOMAIN: &str = "docker.io";
const DOCKER_REGISTRY_DOMAIN: &str = "registry-1.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference: `[domain/]path[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: Option<String>,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parses a reference string without normalizing it.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(Error::InvalidArgument("empty reference".into()));
        }
        if input.len() > MAX_REFERENCE_LEN {
            return Err(Error::InvalidArgument(format!(
                "reference exceeds {MAX_REFERENCE_LEN} characters"
            )));
        }
        // A bare content digest is not a name.
        if is_hex(input) {
            return Err(Error::InvalidArgument(
                "reference cannot be a 64-hex digest".into(),
            ));
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, raw)) => (name, Some(Digest::parse(raw)?)),
            None => (input, None),
        };

        let (domain, remainder) = match name.split_once('/') {
            Some((first, rest)) if is_domain(first) => (Some(first.to_owned()), rest),
            _ => (None, name),
        };

        // The path grammar forbids ':', so any colon here starts the tag.
        let (path, tag) = match remainder.rsplit_once(':') {
            Some((path, tag)) => {
                validate_tag(tag)?;
                (path, Some(tag.to_owned()))
            }
            None => (remainder, None),
        };
        validate_path(path)?;

        Ok(Self {
            domain,
            path: path.to_owned(),
            tag,
            digest,
        })
    }

    /// Applies the normalization rules: official images on Docker Hub get
    /// the `library/` prefix, and untagged references default to
    /// `latest`.
    pub fn normalize(mut self) -> Result<Self> {
        if let Some(ref domain) = self.domain {
            if (domain == DOCKER_DOMAIN || domain == DOCKER_REGISTRY_DOMAIN)
                && !self.path.contains('/')
            {
                self.path = format!("{OFFICIAL_REPO_PREFIX}/{}", self.path);
                validate_path(&self.path)?;
            }
        }
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_owned());
        }
        Ok(self)
    }

    /// Registry host component, if one was written.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Repository path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tag, if one was written or defaulted in.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Pinned digest, if one was written.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The tag or digest string used in registry API paths, preferring
    /// the digest when both are present.
    pub fn identifier(&self) -> Option<String> {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => Some(digest.to_string()),
            (None, Some(tag)) => Some(tag.clone()),
            (None, None) => None,
        }
    }

    /// The domain to actually connect to for this reference.
    pub fn resolved_domain(&self) -> Option<&str> {
        self.domain.as_deref().map(resolve_domain)
    }
}

/// Maps well-known registry aliases to the host that serves the API.
pub fn resolve_domain(domain: &str) -> &str {
    if domain == DOCKER_DOMAIN {
        DOCKER_REGISTRY_DOMAIN
    } else {
        domain
    }
}

/// A leading segment is a registry host only if it could not be a
/// repository component: `localhost`, or anything with a dot or port.
fn is_domain(segment: &str) -> bool {
    segment.starts_with("localhost") || segment.contains('.') || segment.contains(':')
}

fn validate_tag(tag: &str) -> Result<()> {
    let bytes = tag.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= MAX_TAG_LEN
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes[1..]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid tag: {tag}")))
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("empty repository path".into()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::InvalidArgument(format!(
            "repository path exceeds {MAX_PATH_LEN} characters"
        )));
    }
    if !path.split('/').all(valid_path_component) {
        return Err(Error::InvalidArgument(format!(
            "invalid repository path: {path}"
        )));
    }
    Ok(())
}

/// Component grammar: `[a-z0-9]+((.|_|__|-)[a-z0-9]+)*`.
fn valid_path_component(component: &str) -> bool {
    fn alnum(b: u8) -> bool {
        b.is_ascii_digit() || b.is_ascii_lowercase()
    }

    let bytes = component.as_bytes();
    let mut i = 0;

    let run = |i: &mut usize| {
        let start = *i;
        while *i < bytes.len() && alnum(bytes[*i]) {
            *i += 1;
        }
        *i > start
    };

    if !run(&mut i) {
        return false;
    }
    while i < bytes.len() {
        match bytes[i] {
            b'_' if i + 1 < bytes.len() && bytes[i + 1] == b'_' => i += 2,
            b'.' | b'_' | b'-' => i += 1,
            _ => return false,
        }
        if !run(&mut i) {
            return false;
        }
    }
    true
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref domain) = self.domain {
            write!(f, "{domain}/")?;
        }
        write!(f, "{}", self.path)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_DIGEST: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_bare_name() {
        let r = Reference::parse("alpine").unwrap().normalize().unwrap();
        assert_eq!(r.domain(), None);
        assert_eq!(r.path(), "alpine");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn normalize_docker_official() {
        let r = Reference::parse("docker.io/alpine")
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(r.domain(), Some("docker.io"));
        assert_eq!(r.path(), "library/alpine");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.resolved_domain(), Some("registry-1.docker.io"));
    }

    #[test]
    fn normalize_keeps_scoped_paths() {
        let r = Reference::parse("docker.io/org/app:v1")
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(r.path(), "org/app");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn parse_custom_registry_with_port() {
        let r = Reference::parse("localhost:5000/test:v1").unwrap();
        assert_eq!(r.domain(), Some("localhost:5000"));
        assert_eq!(r.path(), "test");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn parse_digest_reference() {
        let r = Reference::parse(&format!("alpine@{HELLO_DIGEST}")).unwrap();
        assert_eq!(r.digest().unwrap().to_string(), HELLO_DIGEST);
        assert_eq!(r.tag(), None);
        // normalize leaves digest-pinned references untagged
        let r = r.normalize().unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.identifier().unwrap(), HELLO_DIGEST);
    }

    #[test]
    fn tag_and_digest_prefers_digest_identifier() {
        let r = Reference::parse(&format!("alpine:3.20@{HELLO_DIGEST}")).unwrap();
        assert_eq!(r.tag(), Some("3.20"));
        assert_eq!(r.identifier().unwrap(), HELLO_DIGEST);
    }

    #[test]
    fn display_round_trip() {
        for input in [
            "alpine",
            "ghcr.io/org/app:v2",
            "localhost:5000/test:v1",
            "docker.io/library/alpine:latest",
            "a/b/c",
            "my_org/my__app:tag_1",
        ] {
            let r = Reference::parse(input).unwrap();
            let again = Reference::parse(&r.to_string()).unwrap();
            assert_eq!(r, again, "{input}");
        }
    }

    #[test]
    fn rejects_hex_only_reference() {
        let hex = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(Reference::parse(hex).is_err());
    }

    #[test]
    fn rejects_invalid_paths() {
        for bad in ["Alpine", "alpine..tag", "-alpine", "alpine-", "a//b", "a/_b", ""] {
            assert!(Reference::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn accepts_separator_forms() {
        for good in ["a.b", "a_b", "a__b", "a-b", "a0/b1.c2_d3-e4"] {
            assert!(Reference::parse(good).is_ok(), "{good:?} should parse");
        }
    }

    #[test]
    fn rejects_invalid_tags() {
        assert!(Reference::parse("alpine:.bad").is_err());
        assert!(Reference::parse("alpine:").is_err());
        let long_tag = "t".repeat(129);
        assert!(Reference::parse(&format!("alpine:{long_tag}")).is_err());
    }

    #[test]
    fn total_length_boundary() {
        // domain(11) + '/' + path(114) + ':' + tag(128) = 255
        let input = format!("example.com/{}:{}", "a".repeat(114), "t".repeat(128));
        assert_eq!(input.len(), 255);
        assert!(Reference::parse(&input).is_ok());

        let over = format!("example.com/{}:{}", "a".repeat(115), "t".repeat(128));
        assert_eq!(over.len(), 256);
        assert!(Reference::parse(&over).is_err());
    }

    #[test]
    fn path_length_boundary() {
        let path = "a".repeat(127);
        assert!(Reference::parse(&path).is_ok());
        let path = "a".repeat(128);
        assert!(Reference::parse(&path).is_err());
    }

    #[test]
    fn resolve_domain_mapping() {
        assert_eq!(resolve_domain("docker.io"), "registry-1.docker.io");
        assert_eq!(resolve_domain("ghcr.io"), "ghcr.io");
    }
}
