pub mod activator;
pub mod app;
pub mod auth;
pub mod backend;
pub mod bundle;
pub mod config;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod pointer;
pub mod quarantine;
pub mod stage;
pub mod storage;
pub mod substrate;
pub mod verifier;
