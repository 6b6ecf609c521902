//! Telegram relay for "new recipe" events: consumes the broker queue, resolves
//! each creator's subscribers and messages their linked Telegram chats.
pub mod config;
pub mod consumer;
pub mod content;
pub mod db;
pub mod fanout;
pub mod handlers;
pub mod model;
pub mod notifier;
