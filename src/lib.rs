//! Support chat for the APNA ADDA learning portal: a per-user conversation
//! with the support team, backed by Firestore or a local SQLite store.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod storage;
pub mod store;
pub mod ui;
pub mod utils;
