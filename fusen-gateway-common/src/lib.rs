pub mod config;
pub mod context;
pub mod error;
pub mod logs;
pub mod model;
pub mod response;
pub mod url;

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;
pub type BoxFutureV2<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub use serde_json;
