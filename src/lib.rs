pub mod config;
pub mod errors;
pub mod fetch;
pub mod hash;
pub mod progress;
pub mod source;
pub mod storage;
pub mod verify;
pub mod worker;
