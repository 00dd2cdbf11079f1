pub mod auth;
pub mod jobs;
pub mod ping;
pub mod reset;
pub mod service;
pub mod setup;
