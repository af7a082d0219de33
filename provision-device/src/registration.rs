use std::fmt::Display;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, debug, field, info, instrument, warn};

use crate::util::http::{DEFAULT_REQUEST_TIMEOUT, InvalidUriError, Uri};
use crate::util::sas::{DEFAULT_TTL, SasToken, expiry_from_now, url_encode};
use crate::util::security::TpmSecurity;
use crate::util::types::{DeviceId, IdScope};

/// Version of the DPS device API this client speaks
pub const API_VERSION: &str = "2019-03-31";

pub const DEFAULT_GLOBAL_ENDPOINT: &str = "https://global.azure-devices-provisioning.net";

/// Key name DPS expects on registration tokens
const REGISTRATION_KEY_NAME: &str = "registration";

/// Wait between operation status requests when the service does not say
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Invalid provisioning endpoint URI: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Security provider failed: {0}")]
    Security(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid authentication key: {0}")]
    InvalidAuthenticationKey(#[from] base64::DecodeError),

    #[error("Service returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("Device registration ended with status '{status}': {message}")]
    NotAssigned {
        status: RegistrationStatus,
        message: String,
    },

    #[error("Device was assigned without a hub or device id")]
    IncompleteAssignment,
}

fn security_error<E>(err: E) -> RegistrationError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RegistrationError::Security(Box::new(err))
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

impl RegistrationStatus {
    /// Whether the service is done with the registration
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Assigned | Self::Failed | Self::Disabled)
    }
}

impl Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Unassigned => "unassigned",
            Self::Assigning => "assigning",
            Self::Assigned => "assigned",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        };
        status.fmt(f)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRegistration<'a> {
    registration_id: &'a str,
    tpm: TpmAttestation,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TpmAttestation {
    endorsement_key: String,
    storage_root_key: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct TpmChallenge {
    authentication_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: String,
    status: RegistrationStatus,
    registration_state: Option<RegistrationResult>,
}

/// Registration state of the device as reported by DPS
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub registration_id: Option<String>,
    pub status: RegistrationStatus,
    pub substatus: Option<String>,
    pub assigned_hub: Option<String>,
    pub device_id: Option<DeviceId>,
    pub created_date_time_utc: Option<String>,
    pub last_updated_date_time_utc: Option<String>,
    pub etag: Option<String>,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
    tpm: Option<TpmChallenge>,
}

impl RegistrationResult {
    /// Assigned hub host name and device id, when assignment completed.
    pub fn assignment(&self) -> Option<(&str, &DeviceId)> {
        if self.status != RegistrationStatus::Assigned {
            return None;
        }
        Some((self.assigned_hub.as_deref()?, self.device_id.as_ref()?))
    }
}

pub struct ProvisioningDeviceClient {
    endpoint: Uri,
    id_scope: IdScope,
    timeout: Duration,
    client: Client,
}

impl ProvisioningDeviceClient {
    pub fn new(endpoint: Uri, id_scope: IdScope) -> Self {
        Self {
            endpoint,
            id_scope,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: Client::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Register the device attested by `security` and wait for DPS to
    /// assign it to a hub.
    ///
    /// DPS answers the first, unauthenticated, request with a nonce
    /// encrypted to the EK. Activating it in the TPM yields the identity key
    /// that signs every further request.
    #[instrument(
        skip_all,
        fields(id_scope = %self.id_scope, registration_id = %security.registration_id(), result = field::Empty),
        err
    )]
    pub async fn register<S: TpmSecurity>(
        &self,
        security: &mut S,
    ) -> Result<RegistrationResult, RegistrationError> {
        let registration_id = security.registration_id().clone();
        let request = DeviceRegistration {
            registration_id: &registration_id,
            tpm: TpmAttestation {
                endorsement_key: STANDARD.encode(security.endorsement_key().map_err(security_error)?),
                storage_root_key: STANDARD
                    .encode(security.storage_root_key().map_err(security_error)?),
            },
        };
        let resource = format!("{}/registrations/{}", self.id_scope, registration_id);
        let register_uri = self.uri(&format!("/{}/register", encode_path(&resource)))?;

        debug!("sending registration request");
        let mut response = self
            .send(self.client.put(register_uri.to_string()).json(&request))
            .await?;

        let mut token = None;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("received TPM challenge");
            let challenge: TpmChallenge = response.json().await?;
            activate(security, &challenge)?;

            let sas = registration_token(security, &resource)?;
            response = self
                .send(
                    self.client
                        .put(register_uri.to_string())
                        .header(header::AUTHORIZATION, sas.to_string())
                        .json(&request),
                )
                .await?;
            token = Some(sas);
        }

        let mut wait = retry_after(&response);
        let mut operation: RegistrationOperation = success(response).await?.json().await?;

        while !operation.status.is_terminal() {
            debug!(
                status = field::display(operation.status),
                "waiting for assignment"
            );
            tokio::time::sleep(wait).await;

            let status_uri = self.uri(&format!(
                "/{}/operations/{}",
                encode_path(&resource),
                url_encode(&operation.operation_id)
            ))?;
            let mut request = self.client.get(status_uri.to_string());
            if let Some(token) = &token {
                request = request.header(header::AUTHORIZATION, token.to_string());
            }
            let response = self.send(request).await?;
            wait = retry_after(&response);
            operation = success(response).await?.json().await?;
        }

        Span::current().record("result", field::display(operation.status));

        let Some(result) = operation.registration_state else {
            return Err(RegistrationError::NotAssigned {
                status: operation.status,
                message: "no registration state returned".to_owned(),
            });
        };

        if result.status != RegistrationStatus::Assigned {
            let message = match (&result.error_message, result.error_code) {
                (Some(message), Some(code)) => format!("{message} ({code})"),
                (Some(message), None) => message.clone(),
                (None, Some(code)) => format!("error code {code}"),
                (None, None) => "no details provided".to_owned(),
            };
            return Err(RegistrationError::NotAssigned {
                status: result.status,
                message,
            });
        }

        if let Some(challenge) = &result.tpm {
            activate(security, challenge)?;
        }

        if result.assignment().is_none() {
            return Err(RegistrationError::IncompleteAssignment);
        }

        info!(
            hub = result.assigned_hub.as_deref().unwrap_or_default(),
            "device assigned"
        );
        Ok(result)
    }

    fn uri(&self, path: &str) -> Result<Uri, InvalidUriError> {
        Uri::from_parts(
            self.endpoint.clone(),
            path,
            Some(&format!("api-version={API_VERSION}")),
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        request
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
    }
}

fn activate<S: TpmSecurity>(
    security: &mut S,
    challenge: &TpmChallenge,
) -> Result<(), RegistrationError> {
    let key = STANDARD.decode(&challenge.authentication_key)?;
    security
        .activate_identity_key(&key)
        .map_err(security_error)
}

fn registration_token<S: TpmSecurity>(
    security: &mut S,
    resource: &str,
) -> Result<SasToken, RegistrationError> {
    SasToken::sign(
        resource,
        expiry_from_now(DEFAULT_TTL),
        Some(REGISTRATION_KEY_NAME),
        |data| security.sign(data),
    )
    .map_err(security_error)
}

/// Encode each segment of a `/` separated path
fn encode_path(path: &str) -> String {
    path.split('/').map(url_encode).collect::<Vec<_>>().join("/")
}

fn retry_after(response: &Response) -> Duration {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

async fn success(response: Response) -> Result<Response, RegistrationError> {
    if !response.status().is_success() {
        warn!(
            response = field::display(response.status()),
            "received error response"
        );
        let err_code = response.status();
        let err_msg = response.text().await.unwrap_or_default();
        return Err(RegistrationError::Status(err_code, err_msg));
    }
    Ok(response)
}
