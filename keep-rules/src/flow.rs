//! Order-invariant TCP flow identity.
//!
//! Packets of one flow appear in both directions, so the flow key must not
//! depend on which endpoint happened to send first. Both pipeline halves
//! canonicalize through this module; any divergence here silently unmatches
//! every rule of a flow.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    net::IpAddr,
};

/// One end of a TCP connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port }
    }

    /// The string form used for the lexicographic endpoint ordering.
    ///
    /// The canonical tuple key is defined over this rendering, not over the
    /// numeric address values.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Direction of a packet relative to the canonical endpoint ordering.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Source is the lexicographically smaller endpoint.
    Forward,
    /// Source is the lexicographically larger endpoint.
    Reverse,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// Canonical identifier for a two-way TCP flow.
///
/// The endpoint pair is stored sorted by [`Endpoint::key`], so constructing
/// a `FlowKey` from `(a, b)` and from `(b, a)` yields the same value.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct FlowKey {
    lo: Endpoint,
    hi: Endpoint,
}

impl FlowKey {
    pub fn from_endpoints(a: Endpoint, b: Endpoint) -> Self {
        if a.key() <= b.key() {
            FlowKey { lo: a, hi: b }
        } else {
            FlowKey { lo: b, hi: a }
        }
    }

    /// `"ip_lo:port_lo-ip_hi:port_hi"` with the smaller endpoint first.
    pub fn tuple_key(&self) -> String {
        format!("{}-{}", self.lo, self.hi)
    }

    /// Direction of a packet sent by `src` within this flow.
    pub fn direction_of(&self, src: Endpoint) -> Direction {
        if src == self.lo {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// Hands out numeric stream ids in encounter order (0, 1, 2, ...).
///
/// Ids are a per-run secondary lookup key for logging and drift-tolerant
/// rule matching. They are not stable across runs; the tuple key is the
/// primary identity.
#[derive(Default, Debug)]
pub struct StreamIdAllocator {
    next: u64,
    by_tuple: HashMap<String, u64>,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the flow, assigning the next free one on first sight.
    pub fn id_for(&mut self, key: &FlowKey) -> u64 {
        let next = &mut self.next;
        *self.by_tuple.entry(key.tuple_key()).or_insert_with(|| {
            let id = *next;
            *next += 1;
            id
        })
    }

    pub fn len(&self) -> usize {
        self.by_tuple.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tuple.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn ep(ip: [u8; 4], port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    #[test]
    fn tuple_key_is_order_invariant() {
        let a = ep([10, 0, 0, 1], 443);
        let b = ep([192, 168, 1, 5], 51000);
        let fwd = FlowKey::from_endpoints(a, b);
        let rev = FlowKey::from_endpoints(b, a);
        assert_eq!(fwd, rev);
        assert_eq!(fwd.tuple_key(), "10.0.0.1:443-192.168.1.5:51000");
    }

    #[test]
    fn ordering_is_lexicographic_not_numeric() {
        // "100.0.0.1" sorts before "99.0.0.1" as a string even though the
        // first octet is numerically larger.
        let a = ep([100, 0, 0, 1], 80);
        let b = ep([99, 0, 0, 1], 80);
        let key = FlowKey::from_endpoints(a, b);
        assert_eq!(key.tuple_key(), "100.0.0.1:80-99.0.0.1:80");
        assert_eq!(key.direction_of(a), Direction::Forward);
        assert_eq!(key.direction_of(b), Direction::Reverse);
    }

    #[test]
    fn direction_flips_with_sender() {
        let a = ep([10, 0, 0, 1], 443);
        let b = ep([10, 0, 0, 2], 52000);
        let key = FlowKey::from_endpoints(b, a);
        assert_eq!(key.direction_of(a), Direction::Forward);
        assert_eq!(key.direction_of(b), Direction::Reverse);
        assert_eq!(key.direction_of(a).flipped(), key.direction_of(b));
    }

    #[test]
    fn stream_ids_follow_encounter_order() {
        let f1 = FlowKey::from_endpoints(ep([10, 0, 0, 1], 443), ep([10, 0, 0, 2], 52000));
        let f2 = FlowKey::from_endpoints(ep([10, 0, 0, 1], 443), ep([10, 0, 0, 3], 52001));
        let mut alloc = StreamIdAllocator::new();
        assert_eq!(alloc.id_for(&f1), 0);
        assert_eq!(alloc.id_for(&f2), 1);
        // repeated lookups are stable
        assert_eq!(alloc.id_for(&f1), 0);
        assert_eq!(alloc.len(), 2);
    }
}
