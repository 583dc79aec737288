pub mod app;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod llm;
pub mod policy;
pub mod session;
pub mod surface;
pub mod whatsapp;
