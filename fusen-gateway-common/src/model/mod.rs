pub mod argument;
pub mod endpoint;
pub mod service;
pub mod value;

pub use argument::Argument;
pub use endpoint::Endpoint;
pub use service::Service;
pub use value::{MTValue, MediaType};
