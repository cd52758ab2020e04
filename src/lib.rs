pub mod aggregate;
pub mod artifact;
pub mod cache;
pub mod calendar;
pub mod classify;
pub mod codec;
pub mod config;
pub mod db;
pub mod documents;
pub mod envelope;
pub mod job;
