//! Renderers for the on-disk credential artifact formats.

use chrono::{DateTime, SecondsFormat, Utc};
use keybridge_core::{AwsCredential, FederationConfig, GcpCredential, TokenSource};
use serde::{Deserialize, Serialize};

/// Environment overrides for the ADC OAuth client pair.
pub const ADC_CLIENT_ID_VAR: &str = "KEYBRIDGE_ADC_CLIENT_ID";
pub const ADC_CLIENT_SECRET_VAR: &str = "KEYBRIDGE_ADC_CLIENT_SECRET";

// The gcloud CLI's published OAuth client. This pair is public by design
// (it ships in every gcloud install); no non-public secret is ever written.
const DEFAULT_ADC_CLIENT_ID: &str =
    "764086051850-6qr4p6gpi6hn506pt8ejuq83di341hur.apps.googleusercontent.com";
const DEFAULT_ADC_CLIENT_SECRET: &str = "d-FL95Q19q7MQmFpd7hHD0Ty";

/// Application-default-credentials JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdcCredentialFile {
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<String>,
    // Workload-identity-federation extension fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_source: Option<serde_json::Value>,
}

impl AdcCredentialFile {
    /// The `authorized_user` shape consumed by Google SDKs. The client pair
    /// comes from environment overrides or the public gcloud default.
    pub fn authorized_user(creds: &GcpCredential) -> Self {
        let client_id =
            std::env::var(ADC_CLIENT_ID_VAR).unwrap_or_else(|_| DEFAULT_ADC_CLIENT_ID.to_string());
        let client_secret = std::env::var(ADC_CLIENT_SECRET_VAR)
            .unwrap_or_else(|_| DEFAULT_ADC_CLIENT_SECRET.to_string());
        Self {
            credential_type: "authorized_user".to_string(),
            access_token: Some(creds.access_token.clone()),
            refresh_token: creds.refresh_token.clone(),
            client_id: Some(client_id),
            client_secret: Some(client_secret),
            token_expiry: creds.token_expiry.map(rfc3339),
            audience: None,
            subject_token_type: None,
            token_url: None,
            credential_source: None,
        }
    }

    /// The `external_account` shape used for workload identity federation.
    pub fn external_account(federation: &FederationConfig) -> Self {
        let credential_source = match &federation.token_source {
            TokenSource::Environment { variable } => serde_json::json!({
                "environment_id": variable,
            }),
            TokenSource::File { path } => serde_json::json!({
                "file": path,
            }),
            TokenSource::Url { url, audience, .. } => serde_json::json!({
                "url": url,
                "audience": audience,
                "format": { "type": "json", "subject_token_field_name": "value" },
            }),
        };
        Self {
            credential_type: "external_account".to_string(),
            access_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            token_expiry: None,
            audience: Some(federation.audience.clone()),
            subject_token_type: Some("urn:ietf:params:oauth:token-type:jwt".to_string()),
            token_url: Some(
                federation
                    .token_url
                    .clone()
                    .unwrap_or_else(|| "https://sts.googleapis.com/v1/token".to_string()),
            ),
            credential_source: Some(credential_source),
        }
    }

    pub fn to_json(&self) -> keybridge_core::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn rfc3339(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// CLI properties file. Both sections are always present, even when empty.
pub fn render_properties(project: Option<&str>, region: Option<&str>) -> String {
    format!(
        "[core]\nproject = {}\n\n[compute]\nregion = {}\n",
        project.unwrap_or(""),
        region.unwrap_or("")
    )
}

/// Bare access-token file: the token, then the expiry only when one is set.
pub fn render_access_token(token: &str, expiry: Option<DateTime<Utc>>) -> String {
    match expiry {
        Some(when) => format!("{}\n{}\n", token, rfc3339(when)),
        None => format!("{}\n", token),
    }
}

/// AWS shared-credentials file for a key-triple credential.
pub fn render_aws_credentials(profile: &str, creds: &AwsCredential) -> String {
    let mut out = format!(
        "[{}]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
        profile,
        creds.access_key_id.as_deref().unwrap_or(""),
        creds.secret_access_key.as_deref().unwrap_or("")
    );
    if let Some(session_token) = &creds.session_token {
        out.push_str(&format!("aws_session_token = {}\n", session_token));
    }
    if let Some(expiration) = creds.expiration {
        out.push_str(&format!("# keybridge: expiration={}\n", rfc3339(expiration)));
    }
    out
}

/// AWS shared-config file carrying the session region.
pub fn render_aws_config(profile: &str, region: Option<&str>) -> String {
    format!("[{}]\nregion = {}\n", profile, region.unwrap_or(""))
}
