pub mod backoff;
pub mod engine;
pub mod ledger;
pub mod paths;
pub mod scanner;
pub mod transfer;
