//! Classification adapter.
//!
//! The external classifier is consumed through the `Classifier` trait. Its
//! reply is validated once, at this boundary, into the closed `Classification`
//! record; everything downstream trusts that record.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CaseError;
use crate::types::{ClassifierConfig, InboundMessage};
use crate::util::normalize_email;

/// Bucket reported when the classifier could not place the message.
pub const UNKNOWN_BUCKET: &str = "desconocido";

// =============================================================================
// Wire contract
// =============================================================================

/// Classifier input: `{subject, normalized_body, from, cc[], attachments_summary}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationRequest {
    pub subject: String,
    pub normalized_body: String,
    pub from: String,
    pub cc: Vec<String>,
    pub attachments_summary: String,
}

impl ClassificationRequest {
    pub fn from_message(msg: &InboundMessage) -> Self {
        Self {
            subject: msg.subject.trim().to_string(),
            normalized_body: normalize_body(&msg.body),
            from: msg.from_address.clone(),
            cc: msg.cc_addresses.clone(),
            attachments_summary: msg.attachments_summary.join(", "),
        }
    }
}

/// Collapse runs of whitespace so the classifier sees compact text.
fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classifier reply exactly as it arrives, before validation.
#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default, alias = "ramo_bucket")]
    bucket: Option<String>,
    #[serde(default)]
    ramo_code: Option<String>,
    #[serde(default, alias = "aseguradora_code")]
    insurer_code: Option<String>,
    #[serde(default, alias = "tramite_code")]
    procedure_code: Option<String>,
    confidence: f64,
    #[serde(default)]
    missing_fields: Vec<String>,
    #[serde(default)]
    broker_email_detected: Option<String>,
    #[serde(default, alias = "case_special_flag")]
    special_flag: Option<String>,
}

/// A validated classification.
///
/// Codes are two-digit numeric strings or absent. `missing_fields` uses the
/// canonical names `ramo`, `insurer` and `procedure` for the code fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawClassification")]
pub struct Classification {
    pub bucket: String,
    pub ramo_code: Option<String>,
    pub insurer_code: Option<String>,
    pub procedure_code: Option<String>,
    pub confidence: f64,
    pub missing_fields: BTreeSet<String>,
    pub broker_email_detected: Option<String>,
    pub special_flag: Option<String>,
}

impl TryFrom<RawClassification> for Classification {
    type Error = CaseError;

    fn try_from(raw: RawClassification) -> Result<Self, Self::Error> {
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(CaseError::InvalidClassification(format!(
                "confidence {} outside 0..1",
                raw.confidence
            )));
        }

        let bucket = raw
            .bucket
            .map(|b| b.trim().to_lowercase())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| UNKNOWN_BUCKET.to_string());

        Ok(Self {
            bucket,
            ramo_code: code_field("ramo_code", raw.ramo_code)?,
            insurer_code: code_field("insurer_code", raw.insurer_code)?,
            procedure_code: code_field("procedure_code", raw.procedure_code)?,
            confidence: raw.confidence,
            missing_fields: raw
                .missing_fields
                .iter()
                .map(|f| canonical_field_name(f))
                .filter(|f| !f.is_empty())
                .collect(),
            broker_email_detected: raw
                .broker_email_detected
                .map(|e| normalize_email(&e))
                .filter(|e| !e.is_empty()),
            special_flag: raw
                .special_flag
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
        })
    }
}

fn code_field(name: &str, value: Option<String>) -> Result<Option<String>, CaseError> {
    match value {
        None => Ok(None),
        Some(raw) => crate::ticket::normalize_code(&raw)
            .map_err(|e| CaseError::InvalidClassification(format!("{name}: {e}"))),
    }
}

/// Map classifier field names (either vocabulary) onto canonical names.
pub fn canonical_field_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.as_str() {
        "ramo" | "ramo_code" => "ramo".to_string(),
        "aseguradora" | "aseguradora_code" | "insurer" | "insurer_code" => "insurer".to_string(),
        "tramite" | "tramite_code" | "procedure" | "procedure_code" => "procedure".to_string(),
        _ => name,
    }
}

/// Canonical names of the fields that gate ticket issuance.
pub const CODE_FIELDS: [&str; 3] = ["ramo", "insurer", "procedure"];

/// Marker left in `missing_fields` when the classifier was not confident
/// enough. Cleared only by a human completing the classification.
pub const REVIEW_MARKER: &str = "classification_review";

/// True when an unresolved field keeps a case from getting its ticket.
pub fn blocks_ticket(field: &str) -> bool {
    field == REVIEW_MARKER || CODE_FIELDS.contains(&field)
}

impl Classification {
    /// Names of code fields that are null or reported missing by the classifier.
    pub fn unresolved_codes(&self) -> BTreeSet<String> {
        let mut unresolved: BTreeSet<String> = self
            .missing_fields
            .iter()
            .filter(|f| CODE_FIELDS.contains(&f.as_str()))
            .cloned()
            .collect();
        if self.ramo_code.is_none() {
            unresolved.insert("ramo".to_string());
        }
        if self.insurer_code.is_none() {
            unresolved.insert("insurer".to_string());
        }
        if self.procedure_code.is_none() {
            unresolved.insert("procedure".to_string());
        }
        unresolved
    }

    /// Parse and validate a classifier reply body.
    pub fn from_json(value: serde_json::Value) -> Result<Self, CaseError> {
        serde_json::from_value(value).map_err(|e| CaseError::InvalidClassification(e.to_string()))
    }
}

// =============================================================================
// Classifier seam
// =============================================================================

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Classify one message. Transport or upstream failure must surface as
    /// `ClassificationUnavailable`, a malformed reply as `InvalidClassification`.
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, CaseError>;
}

// =============================================================================
// HTTP classifier
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, reqwest::Error> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let Some(cloned) = request.try_clone() else {
            return request.send().await;
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && attempt < attempts {
                    let delay =
                        retry_delay(attempt, policy, response.headers().get(reqwest::header::RETRY_AFTER));
                    log::warn!(
                        "Classifier: retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "Classifier: retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Classifier reached over HTTP with bearer auth.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl HttpClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, CaseError> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                CaseError::ClassificationUnavailable("no classifier endpoint configured".to_string())
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| CaseError::ClassificationUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            policy: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, CaseError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = send_with_retry(builder, &self.policy)
            .await
            .map_err(|e| CaseError::ClassificationUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(CaseError::ClassificationUnavailable(format!(
                "classifier returned {status}: {snippet}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CaseError::InvalidClassification(e.to_string()))?;
        Classification::from_json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_original_vocabulary() {
        let c = Classification::from_json(serde_json::json!({
            "ramo_bucket": "vida_assa",
            "ramo_code": "1",
            "aseguradora_code": "05",
            "tramite_code": "2",
            "confidence": 0.85,
            "missing_fields": ["tipo_poliza", "Aseguradora"],
            "broker_email_detected": " Ana@Corredora.COM ",
            "case_special_flag": "solo_pdf"
        }))
        .unwrap();
        assert_eq!(c.bucket, "vida_assa");
        assert_eq!(c.ramo_code.as_deref(), Some("01"));
        assert_eq!(c.insurer_code.as_deref(), Some("05"));
        assert_eq!(c.procedure_code.as_deref(), Some("02"));
        assert!(c.missing_fields.contains("insurer"));
        assert!(c.missing_fields.contains("tipo_poliza"));
        assert_eq!(c.broker_email_detected.as_deref(), Some("ana@corredora.com"));
        assert_eq!(c.special_flag.as_deref(), Some("solo_pdf"));
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let err = Classification::from_json(serde_json::json!({"confidence": 1.4})).unwrap_err();
        assert!(matches!(err, CaseError::InvalidClassification(_)));
    }

    #[test]
    fn test_rejects_non_numeric_code() {
        let err = Classification::from_json(serde_json::json!({
            "confidence": 0.9,
            "ramo_code": "AB"
        }))
        .unwrap_err();
        assert!(matches!(err, CaseError::InvalidClassification(_)));
    }

    #[test]
    fn test_missing_bucket_defaults_to_unknown() {
        let c = Classification::from_json(serde_json::json!({"confidence": 0.3})).unwrap();
        assert_eq!(c.bucket, UNKNOWN_BUCKET);
        assert_eq!(c.unresolved_codes().len(), 3);
    }

    #[test]
    fn test_unresolved_codes_include_reported_missing() {
        let c = Classification::from_json(serde_json::json!({
            "confidence": 0.9,
            "ramo_code": "03",
            "insurer_code": "01",
            "procedure_code": "02",
            "missing_fields": ["tramite"]
        }))
        .unwrap();
        let unresolved: Vec<_> = c.unresolved_codes().into_iter().collect();
        assert_eq!(unresolved, vec!["procedure".to_string()]);
    }

    #[test]
    fn test_request_normalizes_body() {
        let msg = InboundMessage {
            message_id: "m1".into(),
            from_address: "a@b.com".into(),
            cc_addresses: vec![],
            subject: "  Renovación ".into(),
            body: "Hola\n\n  equipo,\tadjunto".into(),
            attachments_summary: vec!["poliza.pdf".into(), "cedula.jpg".into()],
            classification: None,
        };
        let req = ClassificationRequest::from_message(&msg);
        assert_eq!(req.subject, "Renovación");
        assert_eq!(req.normalized_body, "Hola equipo, adjunto");
        assert_eq!(req.attachments_summary, "poliza.pdf, cedula.jpg");
    }

    #[test]
    fn test_retry_delay_honors_retry_after_and_caps() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("120");
        assert_eq!(retry_delay(1, &policy, Some(&header)), Duration::from_secs(30));
        let delay = retry_delay(10, &policy, None);
        assert!(delay < Duration::from_millis(2_150));
    }

    #[test]
    fn test_http_classifier_requires_endpoint() {
        let result = HttpClassifier::from_config(&ClassifierConfig::default());
        assert!(matches!(result, Err(CaseError::ClassificationUnavailable(_))));
    }
}
