pub mod api;
pub mod audio;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod error;
pub mod extract;
pub mod files;
pub mod housekeeping;
pub mod messages;
pub mod relay;
pub mod typing;
pub mod users;
pub mod ws;
