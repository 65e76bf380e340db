// Picshift image transcoding cache library

pub mod config;
pub mod constants;
pub mod error;
pub mod eviction;
pub mod locks;
pub mod logging;
pub mod metadata;
pub mod negotiation;
pub mod prefetch;
pub mod remote;
pub mod resolver;
pub mod server;
pub mod service;
pub mod storage;
pub mod transcoder;
