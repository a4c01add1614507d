//! Port number ranges for building preference lists.

use std::iter::FusedIterator;
use std::str::FromStr;

use crate::error::BridgeError;

/// Lowest port `port_numbers` accepts; below this are privileged ports.
pub const MIN_PORT: u32 = 1024;
/// Highest valid TCP port.
pub const MAX_PORT: u32 = 65_535;

/// Ascending sequence of ports in `[from, to]`.
///
/// Lazy and finite. Cloning yields an independent sequence starting from the
/// clone's current position, so a fresh `port_numbers` call (or a clone taken
/// before iterating) can be replayed for every allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNumbers {
    next: u32,
    to: u32,
}

/// Build the sequence `from..=to`.
///
/// Fails with `Validation` if either bound is outside `[1024, 65535]` or
/// `from > to`.
pub fn port_numbers(from: u32, to: u32) -> crate::Result<PortNumbers> {
    if !(MIN_PORT..=MAX_PORT).contains(&from) {
        return Err(BridgeError::Validation(format!(
            "'from' must be between {} and {}",
            MIN_PORT, MAX_PORT
        )));
    }
    if !(MIN_PORT..=MAX_PORT).contains(&to) {
        return Err(BridgeError::Validation(format!(
            "'to' must be between {} and {}",
            MIN_PORT, MAX_PORT
        )));
    }
    if from > to {
        return Err(BridgeError::Validation(
            "'to' must be greater than or equal to 'from'".to_string(),
        ));
    }
    Ok(PortNumbers { next: from, to })
}

impl Iterator for PortNumbers {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.next > self.to {
            return None;
        }
        let port = self.next as u16;
        self.next += 1;
        Some(port)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.to + 1).saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PortNumbers {}

impl FusedIterator for PortNumbers {}

/// Parses `"from-to"`, e.g. `"13603-13610"`.
impl FromStr for PortNumbers {
    type Err = BridgeError;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (from, to) = s.split_once('-').ok_or_else(|| {
            BridgeError::Validation(format!("port range '{}' must have the form FROM-TO", s))
        })?;
        port_numbers(parse_bound("from", from)?, parse_bound("to", to)?)
    }
}

fn parse_bound(name: &str, value: &str) -> crate::Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        BridgeError::Validation(format!("'{}' must be an integer, got '{}'", name, value))
    })
}

/// Parse a single port number, allowing the full `0..=65535` range.
pub fn parse_port(value: &str) -> crate::Result<u16> {
    value.trim().parse::<u16>().map_err(|_| {
        BridgeError::Validation(format!(
            "'{}' is not a port number between 0 and {}",
            value, MAX_PORT
        ))
    })
}

/// Parse a comma separated list of ports, e.g. `"5000,5001"`.
pub fn parse_port_list(value: &str) -> crate::Result<Vec<u16>> {
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_port)
        .collect()
}
