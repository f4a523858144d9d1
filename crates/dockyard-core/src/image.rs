//! Image reference normalization.

use std::fmt;

/// Tag assumed when an image reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A normalized `name:tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub name: String,
    pub tag: String,
}

impl ImageName {
    /// Split a reference into name and tag.
    ///
    /// Only a colon after the last `/` separates a tag, so a registry port
    /// (`registry:5000/foo`) is kept as part of the name.
    pub fn parse(reference: &str) -> Self {
        let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[slash..].rfind(':') {
            Some(i) if slash + i + 1 < reference.len() => Self {
                name: reference[..slash + i].to_string(),
                tag: reference[slash + i + 1..].to_string(),
            },
            Some(i) => Self {
                name: reference[..slash + i].to_string(),
                tag: DEFAULT_TAG.to_string(),
            },
            None => Self {
                name: reference.to_string(),
                tag: DEFAULT_TAG.to_string(),
            },
        }
    }

    /// `true` if both references normalize to the same `name:tag`.
    pub fn same_as(&self, reference: &str) -> bool {
        *self == Self::parse(reference)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_defaults_to_latest() {
        let img = ImageName::parse("debian");
        assert_eq!(img.name, "debian");
        assert_eq!(img.tag, "latest");
    }

    #[test]
    fn explicit_tag() {
        let img = ImageName::parse("debian:jessie");
        assert_eq!(img.name, "debian");
        assert_eq!(img.tag, "jessie");
    }

    #[test]
    fn registry_with_port_and_tag() {
        let img = ImageName::parse("registry.example.com:49153/ns/foo:bar");
        assert_eq!(img.name, "registry.example.com:49153/ns/foo");
        assert_eq!(img.tag, "bar");
    }

    #[test]
    fn registry_with_port_without_tag() {
        let img = ImageName::parse("registry.example.com:49153/ns/foo");
        assert_eq!(img.name, "registry.example.com:49153/ns/foo");
        assert_eq!(img.tag, "latest");
    }

    #[test]
    fn trailing_colon_defaults_to_latest() {
        let img = ImageName::parse("debian:");
        assert_eq!(img.name, "debian");
        assert_eq!(img.tag, "latest");
    }

    #[test]
    fn same_as_normalizes_both_sides() {
        assert!(ImageName::parse("redis").same_as("redis:latest"));
        assert!(!ImageName::parse("redis:6").same_as("redis"));
        assert_eq!(ImageName::parse("redis").to_string(), "redis:latest");
    }
}
