use std::{fs, path::Path};

use crate::error::BoxError;

pub mod toml;
pub mod yaml;

pub fn get_config_by_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, BoxError> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("read path error : {:?} {}", path, e))?;
    get_config_by_context(&contents, file_type(path))
}

pub fn get_config_by_context<T: serde::de::DeserializeOwned>(
    contents: &str,
    file_type: &str,
) -> Result<T, BoxError> {
    match file_type.as_bytes() {
        b"toml" => toml::get_toml_by_context(contents),
        b"yaml" | b"yml" => yaml::get_yaml_by_context(contents),
        file_type => Err(format!("not support {:?}", String::from_utf8_lossy(file_type)).into()),
    }
}

fn file_type(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Listener {
        id: String,
        port: u16,
    }

    #[test]
    fn test_config_by_context() {
        let toml: Listener = get_config_by_context("id = \"web\"\nport = 8080\n", "toml").unwrap();
        let yaml: Listener = get_config_by_context("id: web\nport: 8080\n", "yaml").unwrap();
        assert_eq!(toml, yaml);
        assert!(get_config_by_context::<Listener>("{}", "ini").is_err());
        assert!(get_config_by_file::<Listener>("./not-exists.toml").is_err());
    }
}
