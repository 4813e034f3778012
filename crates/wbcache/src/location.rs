//! Object identity: references, endpoints, and locations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WritebackError;

/// Opaque content identifier for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference(String);

impl Reference {
    /// Create a reference from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Reference {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Reference {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transport protocol for reaching a remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// A store served over the network.
    Remote,
    /// A store living in the same process, used in tests.
    InProcess,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Remote => f.write_str("remote"),
            Transport::InProcess => f.write_str("inprocess"),
        }
    }
}

impl FromStr for Transport {
    type Err = WritebackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(Transport::Remote),
            "inprocess" => Ok(Transport::InProcess),
            _ => Err(WritebackError::MalformedEndpoint {
                input: s.to_string(),
            }),
        }
    }
}

/// Address of a remote store: a transport plus a network address.
///
/// The string form is `"<transport>,<addr>"` and must round-trip through
/// [`FromStr`], since endpoint strings are path components of the on-disk
/// writeback link schema. Addresses containing `,` or `/` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// How to reach the store.
    pub transport: Transport,
    /// Network address, possibly empty for in-process stores.
    pub addr: String,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(transport: Transport, addr: impl Into<String>) -> Self {
        Self {
            transport,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.transport, self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = WritebackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || WritebackError::MalformedEndpoint {
            input: s.to_string(),
        };
        let (transport, addr) = s.split_once(',').ok_or_else(malformed)?;
        if addr.contains(',') || addr.contains('/') {
            return Err(malformed());
        }
        Ok(Self {
            transport: transport.parse()?,
            addr: addr.to_string(),
        })
    }
}

/// Identity of a pending writeback: which object, bound for which store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// The object's content reference.
    pub reference: Reference,
    /// The store that owns the object.
    pub endpoint: Endpoint,
}

impl Location {
    /// Create a location.
    pub fn new(reference: Reference, endpoint: Endpoint) -> Self {
        Self {
            reference,
            endpoint,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.reference, self.endpoint)
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_endpoint_round_trip_random(addr in "[a-z0-9.:-]{0,24}") {
            let ep = Endpoint::new(Transport::Remote, addr);
            let parsed: Endpoint = ep.to_string().parse().unwrap();
            prop_assert_eq!(parsed, ep);
        }
    }
}
