//! Platform API version negotiation
//!
//! The platform API is the contract between this orchestrator and the
//! lifecycle binaries inside the builder image. Both sides advertise the
//! versions they speak; negotiation picks the highest version present in the
//! orchestrator's own whitelist, the builder's advertised set, and (when a
//! custom lifecycle image is used) the lifecycle's advertised set.

use crate::errors::{ConfigError, Result};
use std::fmt;
use std::str::FromStr;

/// An ordered (major, minor) platform API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn at_least(self, other: PlatformVersion) -> bool {
        self >= other
    }

    pub fn less_than(self, other: PlatformVersion) -> bool {
        self < other
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PlatformVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidApiVersion {
            value: s.to_string(),
        };
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            // a bare major is a valid version with minor 0
            None => (s, "0"),
        };
        Ok(Self {
            major: major.trim().parse().map_err(|_| invalid())?,
            minor: minor.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Platform API versions this orchestrator implements, ascending.
pub const SUPPORTED_PLATFORM_APIS: &[PlatformVersion] = &[
    PlatformVersion::new(0, 3),
    PlatformVersion::new(0, 4),
    PlatformVersion::new(0, 5),
    PlatformVersion::new(0, 6),
    PlatformVersion::new(0, 7),
    PlatformVersion::new(0, 8),
    PlatformVersion::new(0, 9),
    PlatformVersion::new(0, 10),
    PlatformVersion::new(0, 11),
    PlatformVersion::new(0, 12),
];

/// Intersection of two ascending-sorted version lists.
///
/// Two-pointer walk: advances `b` while it trails `a`, emits on equality.
/// Output preserves ascending order.
pub fn api_intersection(
    apis_a: &[PlatformVersion],
    apis_b: &[PlatformVersion],
) -> Vec<PlatformVersion> {
    let mut out = Vec::new();
    let mut bind = 0;
    for &a in apis_a {
        while bind < apis_b.len() && a > apis_b[bind] {
            bind += 1;
        }
        if bind == apis_b.len() {
            break;
        }
        if a == apis_b[bind] {
            out.push(a);
        }
    }
    out
}

/// Find the latest platform API version supported by the builder, the
/// lifecycle (if a custom lifecycle advertised its own set), and this
/// orchestrator.
///
/// `lifecycle_apis` is usually empty; a non-empty list narrows the builder's
/// candidates to the intersection of the two.
pub fn find_latest_supported(
    builder_apis: &[PlatformVersion],
    lifecycle_apis: &[String],
) -> Result<PlatformVersion> {
    let mut builder_sorted = builder_apis.to_vec();
    builder_sorted.sort_unstable();

    let candidates = if !lifecycle_apis.is_empty() {
        let mut lifecycle_sorted = lifecycle_apis
            .iter()
            .map(|v| v.parse::<PlatformVersion>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        lifecycle_sorted.sort_unstable();
        api_intersection(&lifecycle_sorted, &builder_sorted)
    } else {
        builder_sorted
    };

    for &version in SUPPORTED_PLATFORM_APIS.iter().rev() {
        if candidates.contains(&version) {
            return Ok(version);
        }
    }

    Err(ConfigError::UnsupportedPlatformApi.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32) -> PlatformVersion {
        PlatformVersion::new(major, minor)
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("0.12".parse::<PlatformVersion>().unwrap(), v(0, 12));
        assert_eq!("1".parse::<PlatformVersion>().unwrap(), v(1, 0));
        assert_eq!(v(0, 9).to_string(), "0.9");
        assert!("0.x".parse::<PlatformVersion>().is_err());
        assert!("".parse::<PlatformVersion>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric_not_lexical() {
        assert!(v(0, 10) > v(0, 9));
        assert!(v(0, 2) < v(0, 12));
        assert!(v(1, 0) > v(0, 12));
    }

    #[test]
    fn test_intersection_equals_set_intersection_and_is_sorted() {
        let a = [v(0, 3), v(0, 5), v(0, 7), v(0, 9)];
        let b = [v(0, 4), v(0, 5), v(0, 9), v(0, 12)];
        assert_eq!(api_intersection(&a, &b), vec![v(0, 5), v(0, 9)]);
    }

    #[test]
    fn test_intersection_is_commutative() {
        let a = [v(0, 3), v(0, 5), v(0, 7), v(0, 9)];
        let b = [v(0, 4), v(0, 5), v(0, 9), v(0, 12)];
        assert_eq!(api_intersection(&a, &b), api_intersection(&b, &a));
    }

    #[test]
    fn test_intersection_disjoint_and_empty() {
        let a = [v(0, 3), v(0, 4)];
        let b = [v(0, 5), v(0, 6)];
        assert!(api_intersection(&a, &b).is_empty());
        assert!(api_intersection(&a, &[]).is_empty());
        assert!(api_intersection(&[], &b).is_empty());
    }

    #[test]
    fn test_find_latest_supported_builder_only() {
        let builder = [v(0, 7), v(0, 8), v(0, 9)];
        assert_eq!(find_latest_supported(&builder, &[]).unwrap(), v(0, 9));
    }

    #[test]
    fn test_find_latest_supported_with_lifecycle() {
        let builder = [v(0, 7), v(0, 8), v(0, 9), v(0, 10)];
        let lifecycle = vec!["0.7".to_string(), "0.8".to_string()];
        assert_eq!(
            find_latest_supported(&builder, &lifecycle).unwrap(),
            v(0, 8)
        );
    }

    #[test]
    fn test_find_latest_supported_result_is_in_all_sets() {
        let builder = [v(0, 6), v(0, 9), v(0, 12)];
        let lifecycle = vec!["0.9".to_string(), "0.12".to_string()];
        let negotiated = find_latest_supported(&builder, &lifecycle).unwrap();
        assert!(SUPPORTED_PLATFORM_APIS.contains(&negotiated));
        assert!(builder.contains(&negotiated));
        assert!(lifecycle.contains(&negotiated.to_string()));
    }

    #[test]
    fn test_find_latest_supported_no_common_version() {
        let builder = [v(0, 7)];
        let lifecycle = vec!["0.8".to_string()];
        let err = find_latest_supported(&builder, &lifecycle).unwrap_err();
        assert!(err
            .to_string()
            .contains("unable to find a supported Platform API version"));
    }

    #[test]
    fn test_find_latest_supported_parse_failure() {
        let builder = [v(0, 7)];
        let lifecycle = vec!["bogus".to_string()];
        let err = find_latest_supported(&builder, &lifecycle).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_whitelist_is_ascending() {
        for pair in SUPPORTED_PLATFORM_APIS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
