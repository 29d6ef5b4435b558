//! Wire shapes of managed identity responses

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

/// Normalized token response
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedIdentityResponse {
    /// Bearer or PoP access token
    #[serde(default)]
    pub access_token: String,

    /// Expiry as sent by the endpoint: unix seconds or a date string
    #[serde(default, deserialize_with = "string_or_number")]
    pub expires_on: String,

    /// Resource the token is for
    #[serde(default)]
    pub resource: Option<String>,

    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,

    /// Client id of the identity that was used
    #[serde(default)]
    pub client_id: Option<String>,

    /// Seconds after which the token should be proactively refreshed
    #[serde(default, deserialize_with = "optional_string_or_number", skip_serializing_if = "Option::is_none")]
    pub refresh_in: Option<String>,
}

impl ManagedIdentityResponse {
    /// `expires_on` as unix seconds.
    ///
    /// Accepts plain seconds, RFC 2822 and the `MM/DD/YYYY HH:MM:SS +00:00`
    /// form older App Service and Machine Learning endpoints emit.
    pub fn expires_on_timestamp(&self) -> Option<i64> {
        let value = self.expires_on.trim();
        if let Ok(seconds) = value.parse::<i64>() {
            return Some(seconds);
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return Some(date.timestamp());
        }
        if let Ok(date) = DateTime::parse_from_str(value, "%m/%d/%Y %H:%M:%S %:z") {
            return Some(date.timestamp());
        }
        NaiveDateTime::parse_from_str(value, "%m/%d/%Y %H:%M:%S")
            .ok()
            .map(|date| date.and_utc().timestamp())
    }
}

impl fmt::Debug for ManagedIdentityResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedIdentityResponse")
            .field("access_token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .field("resource", &self.resource)
            .field("token_type", &self.token_type)
            .field("client_id", &self.client_id)
            .field("refresh_in", &self.refresh_in)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            Self::String(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(StringOrNumber::into_string)
        .unwrap_or_default())
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?.map(StringOrNumber::into_string))
}

/// Error envelope used by IMDS, App Service, Service Fabric and the token endpoint.
///
/// Covers both `{message, correlationId, error, error_description}` and the
/// camel-cased `{error, errorDescription, correlationId}` variant.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ManagedIdentityErrorResponse {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default, rename = "correlationId", alias = "correlation_id")]
    pub(crate) correlation_id: Option<String>,
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default, alias = "errorDescription")]
    pub(crate) error_description: Option<String>,
}

impl ManagedIdentityErrorResponse {
    fn is_empty(&self) -> bool {
        [&self.message, &self.correlation_id, &self.error, &self.error_description]
            .iter()
            .all(|field| field.as_deref().is_none_or(str::is_empty))
    }
}

/// Cloud Shell nests the error: `{"error": {"code": .., "message": ..}}`
#[derive(Debug, Deserialize)]
pub(crate) struct NestedErrorResponse {
    pub(crate) error: NestedError,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NestedError {
    #[serde(default)]
    pub(crate) code: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

/// Parse attempt signature for error bodies
pub(crate) type ErrorMessageParser = fn(&str) -> Option<String>;

/// Tried in order; the first `Some` wins
pub(crate) const ERROR_MESSAGE_PARSERS: &[ErrorMessageParser] = &[parse_standard_error, parse_nested_error];

pub(crate) fn parse_standard_error(body: &str) -> Option<String> {
    let parsed: ManagedIdentityErrorResponse = serde_json::from_str(body).ok()?;
    if parsed.is_empty() {
        return None;
    }

    let mut message = String::from("[Managed Identity]");
    let mut push = |label: &str, value: &Option<String>| {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            message.push_str(&format!(" {label}: {value}"));
        }
    };
    push("Error Code", &parsed.error);
    push("Error Message", &parsed.message);
    push("Error Description", &parsed.error_description);
    push("Managed Identity Correlation ID", &parsed.correlation_id);
    if parsed.correlation_id.as_deref().is_some_and(|c| !c.is_empty()) {
        message.push_str(" Use this Correlation ID for further investigation.");
    }
    Some(message)
}

pub(crate) fn parse_nested_error(body: &str) -> Option<String> {
    let parsed: NestedErrorResponse = serde_json::from_str(body).ok()?;
    let NestedError { code, message } = parsed.error;
    if code.is_none() && message.is_none() {
        return None;
    }
    Some(format!(
        "[Managed Identity] Error Code: {} Error Message: {}",
        code.unwrap_or_default(),
        message.unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_expires_on_accepts_string_or_number() {
        let a: ManagedIdentityResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_on":"1700000000"}"#).unwrap();
        let b: ManagedIdentityResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_on":1700000000}"#).unwrap();
        assert_eq!(a.expires_on, "1700000000");
        assert_eq!(a, b);
        assert_eq!(a.expires_on_timestamp(), Some(1_700_000_000));
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let r: ManagedIdentityResponse = serde_json::from_str(r#"{"resource":"x"}"#).unwrap();
        assert!(r.access_token.is_empty());
        assert!(r.expires_on.is_empty());
        let r: ManagedIdentityResponse = serde_json::from_str(r#"{"expires_on":null}"#).unwrap();
        assert!(r.expires_on.is_empty());
    }

    #[test]
    fn test_date_formats() {
        let r = ManagedIdentityResponse {
            expires_on: "06/20/2019 02:57:58 +00:00".into(),
            ..Default::default()
        };
        assert_eq!(r.expires_on_timestamp(), Some(1_560_999_478));

        let r = ManagedIdentityResponse {
            expires_on: "Thu, 20 Jun 2019 02:57:58 +0000".into(),
            ..Default::default()
        };
        assert_eq!(r.expires_on_timestamp(), Some(1_560_999_478));

        let r = ManagedIdentityResponse {
            expires_on: "soon".into(),
            ..Default::default()
        };
        assert_eq!(r.expires_on_timestamp(), None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let r = ManagedIdentityResponse {
            access_token: "eyJ-secret".into(),
            ..Default::default()
        };
        assert!(!format!("{r:?}").contains("eyJ-secret"));
    }

    #[test]
    fn test_standard_envelope_formats_all_parts() {
        let message = parse_standard_error(
            r#"{"statusCode":"500","message":"An unexpected error occured while fetching the AAD Token.","correlationId":"7d0c9763-ff1d-4842-a3f3-6d49e64f4513"}"#,
        )
        .unwrap();
        assert!(message.starts_with("[Managed Identity]"));
        assert!(message.contains("Error Message: An unexpected error occured while fetching the AAD Token."));
        assert!(message.contains("Managed Identity Correlation ID: 7d0c9763-ff1d-4842-a3f3-6d49e64f4513"));

        let message = parse_standard_error(
            r#"{"error":"invalid_resource","error_description":"AADSTS500011: The resource principal was not found"}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            "[Managed Identity] Error Code: invalid_resource Error Description: AADSTS500011: The resource principal was not found"
        );

        let message = parse_standard_error(r#"{"error":"e","errorDescription":"camel"}"#).unwrap();
        assert!(message.contains("Error Description: camel"));
    }

    #[test]
    fn test_nested_envelope() {
        let body = r#"{"error":{"code":"TooManyRequests","message":"Rate limit","innererror":{}}}"#;
        assert_eq!(parse_standard_error(body), None);
        assert_eq!(
            parse_nested_error(body).unwrap(),
            "[Managed Identity] Error Code: TooManyRequests Error Message: Rate limit"
        );
    }

    #[test]
    fn test_unknown_shapes_yield_nothing() {
        for body in [r#"{"notExpectedJson":"someValue"}"#, "notExpectedJson", "", "[]"] {
            assert_eq!(
                ERROR_MESSAGE_PARSERS.iter().find_map(|parse| parse(body)),
                None,
                "body: {body}"
            );
        }
    }
}
