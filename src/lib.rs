pub mod adapter;
pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod handlers;
pub mod http;
pub mod http_client;
pub mod models;
pub mod oauth;
pub mod providers;
pub mod queue;
pub mod routes;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod test_support;
