pub mod config;
pub mod consent;
pub mod directory;
pub mod domain;
pub mod events;
pub mod http;
pub mod id;
pub mod lifecycle;
pub mod state;
pub mod tally;
pub mod version;
