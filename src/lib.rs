//! Library exports for the URL shortener application
//!
//! This module exposes internal components for testing and potential library usage.

pub mod config;
pub mod database;
pub mod error;
pub mod handler;
pub mod identity;
pub mod keygen;
pub mod links;
pub mod middleware;
pub mod model;
pub mod oauth;
pub mod route;
pub mod session;
pub mod state;
pub mod token;
pub mod users;
