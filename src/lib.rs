#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod media;
pub mod metadata;
pub mod naming;
pub mod staging;
pub mod storage;
