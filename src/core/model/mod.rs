pub mod address;
pub mod contact;
pub mod direction;
pub mod element;
pub mod identifier;
pub mod peer_contact;
pub mod prefix;
pub mod range;
pub mod replacement;
pub mod time;
pub mod value;

/// Represents the size of an identifier in bytes.
pub const IDENTIFIER_SIZE_BYTES: usize = 32;

/// Upper bound on the number of contact table levels; one prefix bit per level.
pub const MAX_LEVELS: usize = IDENTIFIER_SIZE_BYTES * 8;
