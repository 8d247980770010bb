#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod extraction;
pub mod formats;
pub mod ledger;
pub mod links;
pub mod logging;
pub mod manifest;
pub mod notify;
pub mod openai;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod session;
pub mod status;
pub mod sync;
