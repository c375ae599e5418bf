pub mod resource;

#[cfg(feature = "nacos")]
pub mod nacos;
