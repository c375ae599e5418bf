use fusen_gateway_common::error::BoxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("Error : {0}")]
    Error(BoxError),
    #[error("Resource : {0}")]
    Resource(String),
    #[error("event channel closed")]
    Closed,
}
