pub mod builders;
pub mod connectors;
pub mod db;

pub use builders::TableJobBuilder;
pub use connectors::MemoryConnector;
pub use db::TestDb;
