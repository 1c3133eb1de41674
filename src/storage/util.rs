use serde::{Serialize, de::DeserializeOwned};

pub fn now_unix_ms() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

pub fn to_json_text<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|error| error.to_string())
}

pub fn from_json_text<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_str::<T>(value).map_err(|error| error.to_string())
}
