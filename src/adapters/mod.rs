// Adapters layer: concrete implementations of the domain ports.

pub mod local_storage;
pub mod orgmeter;
pub mod sqlite_store;

pub use local_storage::LocalStorage;
pub use orgmeter::{ClientSettings, OrgMeterClient};
pub use sqlite_store::SqliteStore;
