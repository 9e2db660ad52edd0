pub mod api;
pub mod config;
pub mod download;
pub mod export;
pub mod paths;
pub mod purge;
pub mod rearrange;
pub mod runtime;
