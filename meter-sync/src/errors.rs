use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Payload parse error: {0}")]
    Payload(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not send message to server")]
    Delivery,

    #[error("LED brightness not supported")]
    LedUnsupported,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Builds the error surfaced for a non-success API response.
    pub fn from_status(status: u16, body: &serde_json::Value) -> Self {
        let message = match status {
            401 => "Unauthorized".to_string(),
            403 => "Access denied".to_string(),
            404 => "Resource not found".to_string(),
            500..=599 => "Service temporarily unavailable".to_string(),
            _ => body
                .get("message")
                .or_else(|| body.get("Message"))
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .unwrap_or("Unknown error")
                .to_string(),
        };

        Error::Api { status, message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_messages() {
        assert_eq!(
            Error::from_status(401, &json!({})).to_string(),
            "Unauthorized"
        );
        assert_eq!(
            Error::from_status(503, &json!({"message": "boom"})).to_string(),
            "Service temporarily unavailable"
        );
    }

    #[test]
    fn test_body_message_is_used() {
        let err = Error::from_status(422, &json!({"Message": "Invalid range"}));
        assert_eq!(err.to_string(), "Invalid range");

        let err = Error::from_status(400, &json!({"message": "Bad aggregation"}));
        assert_eq!(err.to_string(), "Bad aggregation");

        let err = Error::from_status(400, &serde_json::Value::Null);
        assert_eq!(err.to_string(), "Unknown error");
    }
}
