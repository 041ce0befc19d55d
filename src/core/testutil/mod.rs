pub mod fixtures;
pub mod random;
