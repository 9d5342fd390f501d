// src/lib.rs

pub mod api;
pub mod app_state;
pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod service;
