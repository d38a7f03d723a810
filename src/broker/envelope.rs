//! JSON response envelope for request/reply services.

use serde::{Deserialize, Serialize};

/// Outcome block of a `Response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseResult {
    /// Status code for transports that have one. Not serialized.
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// `{"result": {...}, "data": ...}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<T> {
    pub result: ResponseResult,
    pub data: T,
}

impl<T> Response<T> {
    pub fn success(data: T) -> Self {
        Self {
            result: ResponseResult {
                status: 200,
                code: "0".to_string(),
                message: "Success".to_string(),
                details: None,
            },
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.code == "0"
    }
}

/// Response without data, used for failures.
pub type ErrorResponse = Response<Option<serde_json::Value>>;

impl ErrorResponse {
    /// Generic failure carrying no data.
    pub fn internal_error() -> Self {
        Self {
            result: ResponseResult {
                status: 500,
                code: "1".to_string(),
                message: "Internal Server Error".to_string(),
                details: None,
            },
            data: None,
        }
    }

    /// Failure whose message is `error`'s text.
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        let mut response = Self::internal_error();
        response.result.message = error.to_string();
        response
    }
}
