use crate::error::BoxError;

pub fn get_yaml_by_context<T: serde::de::DeserializeOwned>(yaml_context: &str) -> Result<T, BoxError> {
    Ok(serde_yaml::from_str(yaml_context).map_err(|e| format!("yaml to json error {:?}", e))?)
}
