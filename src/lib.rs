//! HLS packaging and range-aware content delivery over local, S3 and
//! in-memory storage.

pub mod control;
pub mod core;
pub mod delivery;
pub mod observability;
pub mod package;
pub mod storage;
pub mod transcode;
