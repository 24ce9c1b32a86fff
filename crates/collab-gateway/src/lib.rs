pub mod auth;
pub mod connection;
pub mod gate;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod store;
