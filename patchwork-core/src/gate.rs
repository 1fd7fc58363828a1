use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::descriptor::PatchDescriptor;

/// Host version as an ordered (major, minor, patch) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl HostVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        HostVersion {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for HostVersion {
    type Err = String;

    /// Accepts `1`, `1.4` or `1.4.2`; missing parts are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let parts: Vec<&str> = t.split('.').collect();
        if t.is_empty() || parts.len() > 3 {
            return Err(format!("invalid host version '{}'", s));
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse::<u32>()
                .map_err(|e| format!("invalid host version '{}': {}", s, e))?;
        }
        Ok(HostVersion::new(nums[0], nums[1], nums[2]))
    }
}

impl Serialize for HostVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional host features (expansion content and the like).
pub type Capabilities = BTreeSet<String>;

/// Whether `descriptor` applies to this host. Descriptors without bounds
/// always apply; a false result is a silent skip, not an error.
pub fn is_applicable(
    descriptor: &PatchDescriptor,
    host_version: HostVersion,
    capabilities: &Capabilities,
) -> bool {
    if let Some(min) = descriptor.min_version {
        if host_version < min {
            return false;
        }
    }
    if let Some(max) = descriptor.max_version {
        if host_version > max {
            return false;
        }
    }
    match &descriptor.required_capability {
        Some(cap) => capabilities.contains(cap),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PatchDescriptor;
    use crate::instruction::MethodRef;

    fn descriptor() -> PatchDescriptor {
        PatchDescriptor::rewrite("fixes", "noop", MethodRef::new("Pawn", "Tick"), |_| Ok(()))
    }

    #[test]
    fn parses_partial_versions() {
        assert_eq!("1".parse::<HostVersion>().unwrap(), HostVersion::new(1, 0, 0));
        assert_eq!("1.4".parse::<HostVersion>().unwrap(), HostVersion::new(1, 4, 0));
        assert_eq!("1.4.2".parse::<HostVersion>().unwrap(), HostVersion::new(1, 4, 2));
        assert!("1.x".parse::<HostVersion>().is_err());
        assert!("1.2.3.4".parse::<HostVersion>().is_err());
        assert!("".parse::<HostVersion>().is_err());
    }

    #[test]
    fn orders_as_triple() {
        assert!(HostVersion::new(1, 10, 0) > HostVersion::new(1, 9, 99));
        assert!(HostVersion::new(2, 0, 0) > HostVersion::new(1, 99, 99));
    }

    #[test]
    fn serde_uses_dotted_string() {
        let v: HostVersion = serde_json::from_str("\"1.5.3\"").unwrap();
        assert_eq!(v, HostVersion::new(1, 5, 3));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.5.3\"");
    }

    #[test]
    fn unbounded_descriptor_always_applies() {
        let d = descriptor();
        assert!(is_applicable(&d, HostVersion::new(0, 0, 1), &Capabilities::new()));
        assert!(is_applicable(&d, HostVersion::new(99, 0, 0), &Capabilities::new()));
    }

    #[test]
    fn version_bounds_are_inclusive() {
        let d = descriptor()
            .min_version(HostVersion::new(1, 3, 0))
            .max_version(HostVersion::new(1, 4, 9));
        let caps = Capabilities::new();
        assert!(!is_applicable(&d, HostVersion::new(1, 2, 9), &caps));
        assert!(is_applicable(&d, HostVersion::new(1, 3, 0), &caps));
        assert!(is_applicable(&d, HostVersion::new(1, 4, 9), &caps));
        assert!(!is_applicable(&d, HostVersion::new(1, 5, 0), &caps));
    }

    #[test]
    fn capability_must_be_present() {
        let d = descriptor().requires("Biotech");
        let mut caps = Capabilities::new();
        assert!(!is_applicable(&d, HostVersion::new(1, 0, 0), &caps));
        caps.insert("Biotech".to_string());
        assert!(is_applicable(&d, HostVersion::new(1, 0, 0), &caps));
    }
}
