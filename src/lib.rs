pub mod config;
pub mod controller;
pub mod debugger;
pub mod error;
pub mod inject;
