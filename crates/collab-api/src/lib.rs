pub mod error;
pub mod gateway;
pub mod messages;
pub mod middleware;
pub mod requests;
pub mod routes;
pub mod state;
