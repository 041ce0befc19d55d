use fixedstr::{str128, str8};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// Represents a networking address; composed of host + port.
/// Element owners are reached at their address, so it travels with every stored element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Address {
    host: str128, // up to 128 bytes (on stack)
    port: str8,   // up to 8 bytes (on stack)
}

impl Address {
    /// Create a new Address
    pub fn new(host: &str, port: &str) -> Address {
        Address {
            host: str128::from(host),
            port: str8::from(port),
        }
    }

    /// Get the host
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// Get the port
    pub fn port(&self) -> &str {
        self.port.as_str()
    }

    /// Number of bytes the address occupies on the wire.
    pub fn size_bytes(&self) -> usize {
        self.host().len() + self.port().len() + 2
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host().hash(state);
        self.port().hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address() {
        let address = Address::new("localhost", "1234");
        assert_eq!(address.host(), "localhost");
        assert_eq!(address.port(), "1234");
        assert_eq!(address.to_string(), "localhost:1234");
        assert_eq!(address.size_bytes(), 15);
    }
}
