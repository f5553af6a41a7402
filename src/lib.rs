pub mod auth;
pub mod booking;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod directory;
pub mod http;
pub mod limits;
pub mod mail;
pub mod model;
pub mod notifications;
pub mod observability;
pub mod queue;
pub mod wal;
