pub mod admin;
pub mod auth;
pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod sessions;
pub mod state;
pub mod utils;
pub mod validation;

pub use server::{router, run};
