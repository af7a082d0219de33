use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::cli::Cli;
use crate::console::wait_for_enter;
use crate::device::{ProvisioningDeviceClient, RegistrationError, TelemetryError, send_test_message};
use crate::security::{SecurityError, TpmSecurityProvider};
use crate::service::{
    AttestationMechanism, ConnectionStringError, DeviceCapabilities, EnrollmentError,
    IndividualEnrollment, ProvisioningServiceClient, ProvisioningStatus, ServiceConnectionString,
};
use crate::util::config::{ConfigError, Settings};
use crate::util::security::TpmSecurity;
use crate::util::types::{DeviceId, IdScope, InvalidRegistrationId, RegistrationId};

const USAGE: &str = "ProvisionTpm <IDScope> <RegistrationID> <DeviceID> <SkipTest:Y|N>";

/// Name of the DPS entry under `ConnectionStrings`
const DPS_CONNECTION: &str = "Dps";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    InvalidArguments,
    Failure,
    ConfigError,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::SUCCESS,
            ExitStatus::InvalidArguments => ExitCode::from(1),
            ExitStatus::Failure => ExitCode::from(2),
            // -1 as seen by the shell
            ExitStatus::ConfigError => ExitCode::from(255),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to load settings: {0}")]
    Settings(#[from] ConfigError),

    #[error("The connectionstring of the DPS service is not provided")]
    MissingConnectionString,

    #[error("The connectionstring of the DPS service is invalid: {0}")]
    InvalidConnectionString(#[from] ConnectionStringError),

    #[error("Missing arguments")]
    MissingArguments,

    #[error("Invalid registrationId: {0}")]
    InvalidRegistrationId(#[from] InvalidRegistrationId),

    #[error("TPM operation failed: {0}")]
    Security(#[from] SecurityError),

    #[error("Enrollment failed: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Device registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Test message failed: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Failed to read from console: {0}")]
    Console(#[from] io::Error),
}

impl ProvisionError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Settings(_) | Self::MissingConnectionString | Self::InvalidConnectionString(_) => {
                ExitStatus::ConfigError
            }
            Self::MissingArguments | Self::InvalidRegistrationId(_) => ExitStatus::InvalidArguments,
            Self::Security(_)
            | Self::Enrollment(_)
            | Self::Registration(_)
            | Self::Telemetry(_)
            | Self::Console(_) => ExitStatus::Failure,
        }
    }
}

/// Positional arguments after validation
#[derive(Debug, PartialEq, Eq)]
struct Arguments {
    id_scope: IdScope,
    registration_id: RegistrationId,
    device_id: DeviceId,
    skip_test: bool,
}

impl TryFrom<&Cli> for Arguments {
    type Error = ProvisionError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        // blank values count as missing, anything else is used as given
        let arg = |value: &Option<String>| {
            value
                .as_deref()
                .filter(|value| !value.trim().is_empty())
                .map(str::to_owned)
                .ok_or(ProvisionError::MissingArguments)
        };

        let id_scope = arg(&cli.id_scope)?;
        let registration_id = arg(&cli.registration_id)?;
        let device_id = arg(&cli.device_id)?;
        let skip_test = arg(&cli.skip_test)?;

        Ok(Self {
            id_scope: id_scope.into(),
            registration_id: registration_id.parse()?,
            device_id: device_id.to_uppercase().into(),
            skip_test: skip_test.eq_ignore_ascii_case("y"),
        })
    }
}

/// Run the provisioning flow and map the outcome to the process exit status.
pub async fn run(cli: Cli) -> ExitStatus {
    match provision(&cli).await {
        Ok(()) => ExitStatus::Success,
        Err(err) => {
            report(&err);
            err.exit_status()
        }
    }
}

fn report(err: &ProvisionError) {
    match err {
        ProvisionError::Settings(_)
        | ProvisionError::MissingConnectionString
        | ProvisionError::InvalidConnectionString(_) => {
            println!("{err}");
            println!(
                "Make sure that the appsettings.json file contains an entry for the ConnectionStrings:Dps setting"
            );
        }
        ProvisionError::MissingArguments => {
            println!("Check if the parameters are corrent: {USAGE}");
        }
        ProvisionError::InvalidRegistrationId(_) => {
            println!(
                "Invalid registrationId: The registration ID is alphanumeric, lowercase, and may contain hyphens"
            );
        }
        _ => {
            let message = describe(err);
            error!("{message}");
            println!("{message}");
        }
    }
}

/// Error message followed by any causes not already part of it
fn describe(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }
    message
}

fn load_credentials(cli: &Cli) -> Result<ServiceConnectionString, ProvisionError> {
    let dir = cli.config_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let settings = Settings::load(&dir, Some(cli.environment.as_str()))?;
    let connection_string = settings
        .connection_string(DPS_CONNECTION)
        .ok_or(ProvisionError::MissingConnectionString)?;
    Ok(connection_string.parse()?)
}

fn print_banner() {
    println!("Provision your TPM");
    println!("------------------");
    println!("Usage: {USAGE}");
    println!("Run this 'As Adminsitrator' or 'SU'");
}

async fn provision(cli: &Cli) -> Result<(), ProvisionError> {
    let credentials = load_credentials(cli)?;

    print_banner();

    let args = Arguments::try_from(cli)?;

    // The provider releases its TPM handles when dropped, on every return path
    let mut security = TpmSecurityProvider::open(&cli.tcti, args.registration_id.clone())?;

    println!("Extracting endorsement key.");
    let endorsement_key = STANDARD.encode(security.endorsement_key()?);

    println!(
        "In your Azure Device Provisioning Service please go to 'Manage enrollments' and select \
         'Individual Enrollments'. Select 'Add individual enrollment' then fill in the following:"
    );
    println!("\tMechanism: TPM");
    println!("\tEndorsement key: {endorsement_key}");
    println!("\tRegistration ID: {}", args.registration_id);
    println!("\tSwitch over to the IoT Edge device enrollemnt is needed");
    println!(
        "\tIoT Hub Device ID: {} (or any other valid DeviceID)",
        args.registration_id
    );

    wait_for_enter("Press enter to enroll this device in DPS")?;

    enroll(cli, credentials, &args, endorsement_key).await?;

    println!();
    println!("The device is enrolled in DPS");
    println!("\tCheck if the correct IoT Hub is selected");
    println!("\tFinally, Save this individual enrollment");
    println!();

    wait_for_enter(
        "Press ENTER when ready. This will start finalizing the registration on your TPM",
    )?;

    register(cli, &args, &mut security).await?;

    println!("The registration is finalized on the TPM");
    if !args.skip_test {
        println!("The connection is tested by sending a test message");
    }

    Ok(())
}

#[instrument(skip_all, fields(registration_id = %args.registration_id), err)]
async fn enroll(
    cli: &Cli,
    credentials: ServiceConnectionString,
    args: &Arguments,
    endorsement_key: String,
) -> Result<(), ProvisionError> {
    let client = ProvisioningServiceClient::from_connection_string(credentials)?
        .with_timeout(cli.request_timeout);

    println!("\nCreating a new individualEnrollment...");
    let mut enrollment = IndividualEnrollment::new(
        args.registration_id.clone(),
        AttestationMechanism::tpm(endorsement_key),
    );
    enrollment.device_id = Some(args.device_id.clone());
    enrollment.capabilities = Some(DeviceCapabilities { iot_edge: true });
    enrollment.provisioning_status = Some(ProvisioningStatus::Enabled);

    println!("\nAdding new individualEnrollment...");
    let result = client
        .create_or_update_individual_enrollment(&enrollment)
        .await?;

    println!("\nIndividualEnrollment created with success.");
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(err) => error!("failed to print enrollment: {err}"),
    }

    Ok(())
}

async fn register(
    cli: &Cli,
    args: &Arguments,
    security: &mut TpmSecurityProvider,
) -> Result<(), ProvisionError> {
    let client = ProvisioningDeviceClient::new(cli.global_endpoint.clone(), args.id_scope.clone())
        .with_timeout(cli.request_timeout);

    println!("RegistrationID = {}", args.registration_id);
    println!("ProvisioningClient RegisterAsync . . . ");
    let result = client.register(security).await?;

    let (hub, device_id) = result
        .assignment()
        .ok_or(RegistrationError::IncompleteAssignment)?;
    println!("ProvisioningClient AssignedHub: {hub}; DeviceID: {device_id}");

    if args.skip_test {
        info!("skipping test message");
        return Ok(());
    }

    println!("Testing the provisioned device with IoT Hub...");
    send_test_message(security, hub, device_id, cli.request_timeout).await?;
    println!("Test message sent");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const SETTINGS: &str = r#"{
        "ConnectionStrings": {
            "Dps": "HostName=test-dps.azure-devices-provisioning.net;SharedAccessKeyName=provisioningserviceowner;SharedAccessKey=c2VjcmV0LWtleQ=="
        }
    }"#;

    fn config_dir(settings: Option<&str>) -> TempDir {
        let dir = TempDir::new().unwrap();
        if let Some(settings) = settings {
            fs::write(dir.path().join("appsettings.json"), settings).unwrap();
        }
        dir
    }

    fn cli(dir: &TempDir, args: &[&str]) -> Cli {
        let mut argv = vec![
            "provision-tpm",
            "--config-dir",
            dir.path().to_str().unwrap(),
            // never reached by these tests
            "--tcti",
            "mssim:host=127.0.0.1,port=1",
        ];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn normalizes_arguments() {
        let dir = config_dir(None);
        let args = Arguments::try_from(&cli(&dir, &["0ne000", "edge-01", "edge-01", "y"])).unwrap();
        assert_eq!(
            args,
            Arguments {
                id_scope: "0ne000".into(),
                registration_id: "edge-01".parse().unwrap(),
                device_id: "EDGE-01".into(),
                skip_test: true,
            }
        );

        let args = Arguments::try_from(&cli(&dir, &["0ne000", "edge-01", "edge-01", "N"])).unwrap();
        assert!(!args.skip_test);
    }

    #[test]
    fn keeps_surrounding_whitespace() {
        let dir = config_dir(None);
        let args =
            Arguments::try_from(&cli(&dir, &[" 0ne000", "edge-01", "edge-01 ", "N"])).unwrap();
        assert_eq!(args.id_scope, IdScope::from(" 0ne000"));
        assert_eq!(args.device_id, DeviceId::from("EDGE-01 "));

        let args = Arguments::try_from(&cli(&dir, &["0ne000", "edge-01", "edge-01", " y"])).unwrap();
        assert!(!args.skip_test);
    }

    #[test]
    fn padded_registration_id_is_invalid() {
        let dir = config_dir(None);
        for registration_id in ["edge-01 ", " edge-01", "\tedge-01"] {
            let err = Arguments::try_from(&cli(&dir, &["0ne000", registration_id, "edge-01", "N"]))
                .unwrap_err();
            assert!(
                matches!(err, ProvisionError::InvalidRegistrationId(_)),
                "accepted {registration_id:?}"
            );
        }
    }

    #[test]
    fn blank_argument_is_missing() {
        let dir = config_dir(None);
        let err = Arguments::try_from(&cli(&dir, &["0ne000", "  ", "edge-01", "N"])).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingArguments));
    }

    #[test]
    fn maps_errors_to_exit_status() {
        assert_eq!(
            ProvisionError::MissingConnectionString.exit_status(),
            ExitStatus::ConfigError
        );
        assert_eq!(
            ProvisionError::MissingArguments.exit_status(),
            ExitStatus::InvalidArguments
        );
        assert_eq!(
            ProvisionError::Console(io::Error::other("closed")).exit_status(),
            ExitStatus::Failure
        );
    }

    #[test]
    fn describes_uncontained_causes() {
        #[derive(Debug, Error)]
        #[error("outer")]
        struct Outer(#[source] io::Error);

        let err = Outer(io::Error::other("connection refused"));
        assert_eq!(describe(&err), "outer: connection refused");

        let err = ProvisionError::Console(io::Error::other("closed"));
        assert_eq!(describe(&err), "Failed to read from console: closed");
    }

    #[tokio::test]
    async fn missing_settings_is_a_config_error() {
        let dir = config_dir(None);
        let status = run(cli(&dir, &["0ne000", "edge-01", "edge-01", "N"])).await;
        assert_eq!(status, ExitStatus::ConfigError);
    }

    #[tokio::test]
    async fn missing_connection_string_is_a_config_error() {
        let dir = config_dir(Some(r#"{"ConnectionStrings": {"Dps": ""}}"#));
        let status = run(cli(&dir, &["0ne000", "edge-01", "edge-01", "N"])).await;
        assert_eq!(status, ExitStatus::ConfigError);
    }

    #[tokio::test]
    async fn invalid_connection_string_is_a_config_error() {
        let dir = config_dir(Some(r#"{"ConnectionStrings": {"Dps": "HostName=dps"}}"#));
        let status = run(cli(&dir, &["0ne000", "edge-01", "edge-01", "N"])).await;
        assert_eq!(status, ExitStatus::ConfigError);
    }

    #[tokio::test]
    async fn missing_argument_is_rejected() {
        let dir = config_dir(Some(SETTINGS));
        let status = run(cli(&dir, &["0ne000", "edge-01", "EDGE-01"])).await;
        assert_eq!(status, ExitStatus::InvalidArguments);
    }

    #[tokio::test]
    async fn padded_registration_id_is_rejected() {
        let dir = config_dir(Some(SETTINGS));
        let status = run(cli(&dir, &["0ne000", "edge-01 ", "edge-01", "N"])).await;
        assert_eq!(status, ExitStatus::InvalidArguments);
    }

    #[tokio::test]
    async fn invalid_registration_id_is_rejected() {
        let dir = config_dir(Some(SETTINGS));
        let status = run(cli(&dir, &["0ne000", "Edge_01", "EDGE-01", "N"])).await;
        assert_eq!(status, ExitStatus::InvalidArguments);
    }
}
