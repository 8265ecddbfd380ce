//! Safe upgrade target selection
//!
//! Upgrades may advance at most a configured number of minor versions. A
//! major version boundary can be crossed once, which consumes one unit of the
//! minor budget and lands on the lowest minor series of the next major.

use crate::error::{OperatorError, Result};
use semver::Version;

fn parse_all<S: AsRef<str>>(available: &[S]) -> Result<Vec<Version>> {
    available
        .iter()
        .map(|v| {
            let raw = v.as_ref();
            Version::parse(raw.trim_start_matches('v'))
                .map_err(|e| OperatorError::VersionParse(format!("{}: {}", raw, e)))
        })
        .collect()
}

/// Returns the highest version in `available` that an instance running
/// `base` may upgrade to without advancing more than `max_minor_advance`
/// minor versions.
pub fn highest_safe_version<S: AsRef<str>>(
    available: &[S],
    base: &str,
    max_minor_advance: u64,
) -> Result<Version> {
    let versions = parse_all(available)?;
    let base = Version::parse(base.trim_start_matches('v'))
        .map_err(|e| OperatorError::VersionParse(format!("{}: {}", base, e)))?;

    let newer: Vec<&Version> = versions.iter().filter(|v| **v > base).collect();
    if newer.is_empty() {
        return Ok(base);
    }

    let minor_ceiling = base.minor.saturating_add(max_minor_advance);
    let same_major = newer
        .iter()
        .filter(|v| v.major == base.major && v.minor <= minor_ceiling)
        .max()
        .copied();

    let reached_ceiling = same_major.is_some_and(|v| v.minor == minor_ceiling);
    let next_major = if reached_ceiling || max_minor_advance == 0 {
        None
    } else {
        let lowest_minor = newer
            .iter()
            .filter(|v| v.major == base.major + 1)
            .map(|v| v.minor)
            .min();
        lowest_minor.and_then(|lowest| {
            newer
                .iter()
                .filter(|v| v.major == base.major + 1 && v.minor <= lowest)
                .max()
                .copied()
        })
    };

    match (same_major, next_major) {
        (Some(same), Some(next)) if next > same => Ok(next.clone()),
        (Some(same), _) => Ok(same.clone()),
        (None, Some(next)) => Ok(next.clone()),
        (None, None) => Err(OperatorError::NoQualifyingVersion(format!(
            "no version within {} minor versions of {}",
            max_minor_advance, base
        ))),
    }
}

/// Returns every version in `available` no newer than `latest` and within
/// `n` minor versions of it, newest first. When the major series of
/// `latest` runs out of minor versions, the window continues into the
/// highest minor series of the previous major.
pub fn versions_within_n_minor<S: AsRef<str>>(
    available: &[S],
    latest: &str,
    n: u64,
) -> Result<Vec<Version>> {
    let versions = parse_all(available)?;
    let latest = Version::parse(latest.trim_start_matches('v'))
        .map_err(|e| OperatorError::VersionParse(format!("{}: {}", latest, e)))?;

    let lowest_same_major_minor = latest.minor.saturating_sub(n);
    let mut window: Vec<Version> = versions
        .iter()
        .filter(|v| {
            **v <= latest && v.major == latest.major && v.minor >= lowest_same_major_minor
        })
        .cloned()
        .collect();

    // Stepping from minor 0 of this major into the previous one costs one
    // step, like crossing forward does.
    if n > latest.minor && latest.major > 0 {
        let remaining = n - latest.minor;
        let previous_major = latest.major - 1;
        let highest_minor = versions
            .iter()
            .filter(|v| v.major == previous_major)
            .map(|v| v.minor)
            .max();
        if let Some(highest) = highest_minor {
            let lowest = highest.saturating_sub(remaining - 1);
            window.extend(
                versions
                    .iter()
                    .filter(|v| v.major == previous_major && v.minor >= lowest)
                    .cloned(),
            );
        }
    }

    if window.is_empty() {
        return Err(OperatorError::NoQualifyingVersion(format!(
            "no version within {} minor versions of {}",
            n, latest
        )));
    }

    window.sort_by(|a, b| b.cmp(a));
    window.dedup();
    Ok(window)
}
