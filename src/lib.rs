//! Multi-persona chat coordination: sessions, reply decisions and paced delivery.

pub mod chatbot;
pub mod config;
