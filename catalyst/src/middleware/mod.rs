pub mod auth;
pub mod log;

pub use auth::IngestToken;
pub use log::Txn;
