pub mod config;
pub mod contact;
pub mod controller;
pub mod element;
pub mod model;
pub mod node;
#[cfg(test)]
pub mod testutil;

pub use crate::core::config::{Config, ConfigBuilder, LoggingConfig};
pub use crate::core::contact::{ContactLevel, ContactTable};
pub use crate::core::controller::{NodeController, ThresholdAction, UpdatePlan};
pub use crate::core::element::{ElementTable, UpdateBatch};
pub use crate::core::model::address::Address;
pub use crate::core::model::contact::SkipgraphContact;
pub use crate::core::model::direction::{Direction, LevelKey};
pub use crate::core::model::element::Element;
pub use crate::core::model::identifier::Identifier;
pub use crate::core::model::peer_contact::PeerContact;
pub use crate::core::model::range::KeyRange;
pub use crate::core::model::time::Timestamp;
pub use crate::core::model::value::Value;
pub use crate::core::node::SkipgraphNode;
