use fusen_gateway_common::error::BoxError;
use fusen_gateway_register::error::RegisterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Error : {0}")]
    Error(#[from] BoxError),
    #[error("Io : {0}")]
    Io(#[from] std::io::Error),
    #[error("Register : {0}")]
    Register(#[from] RegisterError),
    #[error("Config : {0}")]
    Config(String),
}
