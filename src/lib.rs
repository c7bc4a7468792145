mod env;
mod ingestion;
mod log;
mod serve;

pub use ingestion::start_deposit_tracking;
pub use serve::start_server;
