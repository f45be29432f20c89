// Ledger entities and the persistence gateway
pub mod expenses;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod validation;

pub use memory::InMemorySettlementStore;
pub use postgres::PgSettlementStore;
pub use store::SettlementStore;
