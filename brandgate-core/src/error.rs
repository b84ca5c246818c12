use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use http::HeaderValue;
use serde::Serialize;
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(Clone, Debug, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
// As long as the struct member is private, we force people to use the `new` method and log the error.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Infrastructure failures are absorbed by the governance layer (fail-open,
    /// degrade gracefully); policy denials are surfaced to the caller.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self.get_details(),
            ErrorDetails::RateLimitExceeded { .. } | ErrorDetails::BudgetExceeded { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Serialize, ThisError)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    #[error("Monthly budget for service `{service}` is exhausted ({percent_used:.1}% used)")]
    BudgetExceeded { service: String, percent_used: f64 },
    #[error("Response cache error: {message}")]
    Cache { message: String },
    #[error("Circuit open for provider `{provider}` operation `{operation}`; serving fallback")]
    CircuitOpen { provider: String, operation: String },
    #[error("Config error: {message}")]
    Config { message: String },
    #[error("Internal error: {message}")]
    InternalError { message: String },
    #[error("Observability setup error: {message}")]
    Observability { message: String },
    #[error("Error connecting to Postgres: {message}")]
    PostgresConnection { message: String },
    #[error("Error running Postgres query: {message}")]
    PostgresQuery { message: String },
    #[error("Provider `{provider}` failed for operation `{operation}`: {message}")]
    ProviderCall {
        provider: String,
        operation: String,
        message: String,
    },
    #[error("Provider `{provider}` timed out for operation `{operation}` after {timeout:?}")]
    ProviderTimeout {
        provider: String,
        operation: String,
        #[serde(skip)]
        timeout: Duration,
    },
    #[error("Rate limit exceeded for category `{category}`; retry after {retry_after_s}s")]
    RateLimitExceeded {
        category: String,
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_s: u64,
    },
    #[error("Serialization error: {message}")]
    Serialization { message: String },
    #[error("Error connecting to Valkey: {message}")]
    ValkeyConnection { message: String },
    #[error("Error running Valkey command: {message}")]
    ValkeyQuery { message: String },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::BudgetExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::Cache { .. } => tracing::Level::WARN,
            ErrorDetails::CircuitOpen { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderCall { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyQuery { .. } => tracing::Level::ERROR,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresConnection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ProviderCall { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ValkeyConnection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ValkeyQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A machine-readable code surfaced in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorDetails::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            ErrorDetails::Cache { .. } => "CACHE_ERROR",
            ErrorDetails::CircuitOpen { .. } => "PROVIDER_UNAVAILABLE",
            ErrorDetails::Config { .. } => "CONFIG_ERROR",
            ErrorDetails::InternalError { .. } => "INTERNAL_ERROR",
            ErrorDetails::Observability { .. } => "OBSERVABILITY_ERROR",
            ErrorDetails::PostgresConnection { .. } | ErrorDetails::PostgresQuery { .. } => {
                "STORE_UNAVAILABLE"
            }
            ErrorDetails::ProviderCall { .. } => "PROVIDER_ERROR",
            ErrorDetails::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            ErrorDetails::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ErrorDetails::Serialization { .. } => "SERIALIZATION_ERROR",
            ErrorDetails::ValkeyConnection { .. } | ErrorDetails::ValkeyQuery { .. } => {
                "STORE_UNAVAILABLE"
            }
        }
    }

    pub fn log_at_level(&self, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level(self.level());
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response with the structured JSON body:
    /// `{"success": false, "error": {"code": ..., "message": ...}}`
    fn into_response(self) -> Response {
        let details = self.get_details();
        let mut error_body = json!({
            "code": details.code(),
            "message": self.to_string(),
        });
        if let ErrorDetails::RateLimitExceeded { retry_after_s, .. } = details {
            error_body["retryAfter"] = json!(retry_after_s);
        }
        let body = json!({
            "success": false,
            "error": error_body,
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        // Rejected callers get the same window headers admitted ones do, so a
        // client can back off without a second probe request.
        if let ErrorDetails::RateLimitExceeded {
            limit,
            reset_at,
            retry_after_s,
            ..
        } = self.get_details()
        {
            let headers = response.headers_mut();
            if let Ok(value) = retry_after_s.to_string().parse() {
                headers.insert(http::header::RETRY_AFTER, value);
            }
            if let Ok(value) = limit.to_string().parse() {
                headers.insert(crate::endpoints::RATELIMIT_LIMIT_HEADER, value);
            }
            headers.insert(
                crate::endpoints::RATELIMIT_REMAINING_HEADER,
                HeaderValue::from_static("0"),
            );
            if let Ok(value) = reset_at.timestamp().to_string().parse() {
                headers.insert(crate::endpoints::RATELIMIT_RESET_HEADER, value);
            }
        }
        response.extensions_mut().insert(self);
        response
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorDetails::PostgresQuery {
            message: err.to_string(),
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::new(ErrorDetails::ValkeyQuery {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rate_limit_error_response_shape() {
        let reset_at = Utc.with_ymd_and_hms(2026, 8, 20, 13, 0, 0).single().unwrap();
        let error = Error::new(ErrorDetails::RateLimitExceeded {
            category: "ai".to_string(),
            limit: 20,
            reset_at,
            retry_after_s: 42,
        });
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.get_details().code(), "RATE_LIMIT_EXCEEDED");

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(
            headers
                .get(http::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("42")
        );
        assert_eq!(headers[crate::endpoints::RATELIMIT_LIMIT_HEADER], "20");
        assert_eq!(headers[crate::endpoints::RATELIMIT_REMAINING_HEADER], "0");
        assert_eq!(
            headers[crate::endpoints::RATELIMIT_RESET_HEADER],
            reset_at.timestamp().to_string().as_str()
        );
    }

    #[test]
    fn test_policy_denials_are_classified() {
        let rate_limited = Error::new(ErrorDetails::RateLimitExceeded {
            category: "api".to_string(),
            limit: 100,
            reset_at: Utc::now(),
            retry_after_s: 1,
        });
        assert!(rate_limited.is_policy_denial());

        let store_down = Error::new(ErrorDetails::ValkeyConnection {
            message: "connection refused".to_string(),
        });
        assert!(!store_down.is_policy_denial());
    }

    #[test]
    fn test_budget_exceeded_maps_to_payment_required() {
        let error = Error::new(ErrorDetails::BudgetExceeded {
            service: "image_generation".to_string(),
            percent_used: 104.2,
        });
        assert_eq!(error.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(error.get_details().code(), "BUDGET_EXCEEDED");
    }
}
