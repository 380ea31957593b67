pub mod app;
pub mod archive;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod dump;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod notify;
pub mod retention;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
