mod contact_level;
mod contact_table;

pub use contact_level::ContactLevel;
pub use contact_table::ContactTable;
