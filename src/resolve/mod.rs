//! Endpoint name resolution.
//!
//! Device names in a tailnet are fully qualified (`laptop.tail1234.ts.net`).
//! For display, each device is shortened to the fewest leading dot-separated
//! segments that still keep every device name distinct.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::Device;

/// Largest number of name segments tried before giving up.
pub const MAX_PREFIX_SEGMENTS: usize = 10;

/// Address to display name.
pub type NameMap = HashMap<IpAddr, String>;

/// Errors produced while building a [`NameMap`].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unable to produce unique names for {devices} devices within {max} segments")]
    NotUnique { devices: usize, max: usize },
}

/// Returns the first `n` dot-separated segments of `name`.
///
/// The whole name is returned when it has fewer than `n` segments, and a
/// single trailing dot is trimmed.
pub fn field_prefix(name: &str, n: usize) -> &str {
    let mut end = 0;
    let mut rest = name;

    for _ in 0..n {
        if rest.is_empty() {
            break;
        }
        match rest.find('.') {
            Some(i) => {
                end += i + 1;
                rest = &rest[i + 1..];
            }
            None => {
                end = name.len();
                rest = "";
            }
        }
    }

    let prefix = &name[..end];
    prefix.strip_suffix('.').unwrap_or(prefix)
}

/// Builds the shortest-unique-prefix name map for a device directory.
pub fn build_name_map(devices: &[Device]) -> Result<NameMap, ResolveError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(devices.len());

    'retry: for n in 1..=MAX_PREFIX_SEGMENTS {
        seen.clear();
        for device in devices {
            if !seen.insert(field_prefix(&device.name, n)) {
                continue 'retry;
            }
        }

        debug!(segments = n, devices = devices.len(), "found unique name prefix");
        return Ok(assign_names(devices, n));
    }

    Err(ResolveError::NotUnique {
        devices: devices.len(),
        max: MAX_PREFIX_SEGMENTS,
    })
}

fn assign_names(devices: &[Device], n: usize) -> NameMap {
    let mut names = NameMap::with_capacity(devices.len() * 2);

    for device in devices {
        let name = field_prefix(&device.name, n);
        for addr in &device.addresses {
            match addr.parse::<IpAddr>() {
                Ok(ip) => {
                    names.insert(ip, name.to_string());
                }
                Err(_) => {
                    warn!(device = %device.name, address = %addr, "skipping unparseable device address");
                }
            }
        }
    }

    names
}

/// Shared, atomically replaceable name map.
///
/// Readers get an `Arc` snapshot without locking; a rebuild swaps in a whole
/// new map.
pub struct Resolver {
    inner: ArcSwapOption<NameMap>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            inner: ArcSwapOption::empty(),
        }
    }

    /// Replaces the current map.
    pub fn store(&self, names: NameMap) {
        self.inner.store(Some(Arc::new(names)));
    }

    /// Returns the current map, if one has been built.
    pub fn load(&self) -> Option<Arc<NameMap>> {
        self.inner.load_full()
    }

    /// Rebuilds the map from a directory snapshot.
    ///
    /// On error the previous map stays in place.
    pub fn rebuild(&self, devices: &[Device]) -> Result<usize, ResolveError> {
        let names = build_name_map(devices)?;
        let count = names.len();
        self.store(names);
        Ok(count)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
