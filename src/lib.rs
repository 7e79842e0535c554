pub mod adaptor;
pub mod app;
pub mod auth;
pub mod batch;
pub mod channels;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod ledger;
pub mod pricing;
pub mod relay;
pub mod sensitive;
pub mod settings;
pub mod tokenizer;
pub mod upstream;
pub mod users;
