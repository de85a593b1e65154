mod auth;
mod middleware;
mod routes;
mod server;
mod state;

pub use server::{router, GatewayServer};
