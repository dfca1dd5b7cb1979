//! Strict semantic versioning (semver.org 2.0.0).
//!
//! Format: `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILDMETADATA]`.
//! Build metadata is ignored for equality and precedence.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Semver {
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Vec<String>,
    build_metadata: Vec<String>,
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit())
}

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-')
}

fn parse_core_number(s: &str) -> Result<u64> {
    if !is_numeric(s) {
        return Err(Error::Parse(
            "MAJOR, MINOR, and PATCH must be numeric".to_string(),
        ));
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(Error::Parse(
            "Version numbers must not have leading zeros".to_string(),
        ));
    }
    s.parse::<u64>()
        .map_err(|_| Error::Parse("Version number out of range".to_string()))
}

// Splits a dot-separated identifier section (without its leading '-' or '+').
fn parse_identifiers(section: &str, what: &str, reject_leading_zero: bool) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for id in section.split('.') {
        if !is_valid_identifier(id) {
            return Err(Error::Parse(format!("Invalid {} identifier", what)));
        }
        if reject_leading_zero && is_numeric(id) && id.len() > 1 && id.starts_with('0') {
            return Err(Error::Parse(format!(
                "Numeric {} identifiers must not have leading zeros",
                what
            )));
        }
        out.push(id.to_string());
    }
    Ok(out)
}

impl Semver {
    pub fn parse(version: &str) -> Result<Semver> {
        if version.is_empty() {
            return Err(Error::Parse("Empty version string".to_string()));
        }

        // Separate core version from pre-release / build metadata.
        let core_end = version
            .find(['-', '+'])
            .unwrap_or(version.len());
        let core = &version[..core_end];
        let mut rest = &version[core_end..];

        let mut parts = core.split('.');
        let (major_str, minor_str, patch_str) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c), None) => (a, b, c),
                _ => {
                    return Err(Error::Parse(
                        "Invalid core version format, expected MAJOR.MINOR.PATCH".to_string(),
                    ))
                }
            };

        let major = parse_core_number(major_str)?;
        let minor = parse_core_number(minor_str)?;
        let patch = parse_core_number(patch_str)?;

        let mut prerelease = Vec::new();
        if let Some(section) = rest.strip_prefix('-') {
            let end = section.find('+').unwrap_or(section.len());
            prerelease = parse_identifiers(&section[..end], "pre-release", true)?;
            rest = &section[end..];
        }

        let mut build_metadata = Vec::new();
        if let Some(section) = rest.strip_prefix('+') {
            build_metadata = parse_identifiers(section, "build metadata", false)?;
        }

        Ok(Semver {
            major,
            minor,
            patch,
            prerelease,
            build_metadata,
        })
    }

    pub fn from_components(
        major: u64,
        minor: u64,
        patch: u64,
        prerelease: Vec<String>,
        build_metadata: Vec<String>,
    ) -> Result<Semver> {
        for id in &prerelease {
            if !is_valid_identifier(id)
                || (is_numeric(id) && id.len() > 1 && id.starts_with('0'))
            {
                return Err(Error::Parse("Invalid pre-release identifier".to_string()));
            }
        }
        for id in &build_metadata {
            if !is_valid_identifier(id) {
                return Err(Error::Parse("Invalid build metadata identifier".to_string()));
            }
        }
        Ok(Semver {
            major,
            minor,
            patch,
            prerelease,
            build_metadata,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn prerelease(&self) -> &[String] {
        &self.prerelease
    }

    pub fn build_metadata(&self) -> &[String] {
        &self.build_metadata
    }

    pub fn has_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }

    // Pre-release precedence: absence outranks presence; identifiers compare
    // pairwise, numeric before alphanumeric, shorter list wins on a prefix tie.
    fn compare_prerelease(&self, other: &Semver) -> Ordering {
        match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }

        for (l, r) in self.prerelease.iter().zip(other.prerelease.iter()) {
            let ord = match (is_numeric(l), is_numeric(r)) {
                (true, true) => {
                    let lv: u64 = l.parse().unwrap_or(u64::MAX);
                    let rv: u64 = r.parse().unwrap_or(u64::MAX);
                    lv.cmp(&rv)
                }
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => l.cmp(r),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }

        self.prerelease.len().cmp(&other.prerelease.len())
    }
}

impl FromStr for Semver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Semver> {
        Semver::parse(s)
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        for (i, id) in self.prerelease.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { '-' } else { '.' }, id)?;
        }
        for (i, id) in self.build_metadata.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { '+' } else { '.' }, id)?;
        }
        Ok(())
    }
}

// Build metadata is excluded from equality per the semver spec.
impl PartialEq for Semver {
    fn eq(&self, other: &Self) -> bool {
        self.major == other.major
            && self.minor == other.minor
            && self.patch == other.patch
            && self.prerelease == other.prerelease
    }
}

impl Eq for Semver {}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| self.compare_prerelease(other))
    }
}
