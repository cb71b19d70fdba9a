#![doc = include_str!("../README.md")]

mod archive;
mod compress;
mod config;
mod create;
mod error;
mod gauge;
pub mod objstore;
mod reader;
mod sink;
mod upload;
mod writers;

pub use config::Config;
pub use create::*;
pub use error::{ErrorKind, Result, S3TgzError};
pub use objstore::{memory::MemoryBucket, Bucket, ObjectDescriptor, PartAck};
