#![forbid(unsafe_code)]

pub mod admin;
pub mod admission;
pub mod billing;
pub mod config;
pub mod directory;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod model;
pub mod openai;
pub mod permissions;
pub mod proxy;
pub mod selector;
pub mod state;
pub mod storage;
pub mod upstream;
pub mod util;
