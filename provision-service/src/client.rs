use std::time::Duration;

use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tracing::{Span, debug, field, instrument, warn};

use crate::connection::{ConnectionStringError, ServiceConnectionString};
use crate::enrollment::IndividualEnrollment;
use crate::util::http::{DEFAULT_REQUEST_TIMEOUT, InvalidUriError, Uri};
use crate::util::sas::{DEFAULT_TTL, expiry_from_now, url_encode};

/// Version of the DPS service API this client speaks
pub const API_VERSION: &str = "2021-10-01";

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("Invalid service endpoint URI: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("Failed to authorize request: {0}")]
    Authorization(#[from] ConnectionStringError),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Service returned error: ({0}) {1}")]
    Status(StatusCode, String),
}

pub struct ProvisioningServiceClient {
    endpoint: Uri,
    credentials: ServiceConnectionString,
    timeout: Duration,
    client: Client,
}

impl ProvisioningServiceClient {
    /// Create a client for the DPS instance named in the connection string.
    pub fn from_connection_string(
        credentials: ServiceConnectionString,
    ) -> Result<Self, EnrollmentError> {
        let endpoint = Uri::from_host(credentials.host_name())?;
        Ok(Self::new(endpoint, credentials))
    }

    /// Create a client talking to `endpoint` instead of the connection
    /// string host. Tokens are still scoped to the connection string host.
    pub fn new(endpoint: Uri, credentials: ServiceConnectionString) -> Self {
        Self {
            endpoint,
            credentials,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: Client::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Create the enrollment, or replace the existing one with the same
    /// registration id. When the enrollment carries an etag the update only
    /// succeeds if the stored record still has that etag.
    #[instrument(
        skip_all,
        fields(registration_id = %enrollment.registration_id, result = field::Empty),
        err
    )]
    pub async fn create_or_update_individual_enrollment(
        &self,
        enrollment: &IndividualEnrollment,
    ) -> Result<IndividualEnrollment, EnrollmentError> {
        let endpoint = Uri::from_parts(
            self.endpoint.clone(),
            &format!("/enrollments/{}", url_encode(&enrollment.registration_id)),
            Some(&format!("api-version={API_VERSION}")),
        )?;
        let token = self.credentials.sas_token(expiry_from_now(DEFAULT_TTL))?;

        debug!(
            key_name = self.credentials.shared_access_key_name(),
            expiry = token.expiry(),
            "calling service"
        );
        let mut request = self
            .client
            .put(endpoint.to_string())
            .header(header::AUTHORIZATION, token.to_string())
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .json(enrollment);
        if let Some(etag) = &enrollment.etag {
            request = request.header(header::IF_MATCH, etag);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            warn!(
                response = field::display(response.status()),
                "received error response"
            );
            let err_code = response.status();
            let err_msg = response.text().await.unwrap_or_default();
            return Err(EnrollmentError::Status(err_code, err_msg));
        }

        Span::current().record("result", field::display(response.status()));

        let enrollment = response.json().await?;
        Ok(enrollment)
    }
}
