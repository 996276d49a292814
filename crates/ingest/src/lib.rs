pub mod http;
pub mod mirror;
pub mod server;
pub mod sink;
pub mod zipkin;
