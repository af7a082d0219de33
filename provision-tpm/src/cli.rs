use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::DEFAULT_GLOBAL_ENDPOINT;
use crate::util::http::Uri;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// ID scope of the DPS instance
    #[arg(value_name = "IDScope")]
    pub id_scope: Option<String>,

    /// Registration id of the individual enrollment, lowercase
    #[arg(value_name = "RegistrationID")]
    pub registration_id: Option<String>,

    /// Device id to assign in IoT Hub
    #[arg(value_name = "DeviceID")]
    pub device_id: Option<String>,

    /// Pass 'Y' to skip sending a test message to the hub
    #[arg(value_name = "SkipTest:Y|N")]
    pub skip_test: Option<String>,

    /// Directory holding appsettings.json, defaults to the working directory
    #[arg(env = "PROVISION_TPM_CONFIG_DIR", long = "config-dir", value_name = "dir")]
    pub config_dir: Option<PathBuf>,

    /// Settings environment, selects appsettings.<environment>.json
    #[arg(
        env = "PROVISION_TPM_ENVIRONMENT",
        long = "environment",
        value_name = "name",
        default_value = "development"
    )]
    pub environment: String,

    /// TPM transmission interface, eg. "mssim:host=localhost,port=2321"
    #[arg(
        env = "PROVISION_TPM_TCTI",
        long = "tcti",
        value_name = "conf",
        default_value = "device:/dev/tpmrm0"
    )]
    pub tcti: String,

    /// DPS global device endpoint URI
    #[arg(
        env = "PROVISION_TPM_GLOBAL_ENDPOINT",
        long = "global-endpoint",
        value_name = "uri",
        default_value = DEFAULT_GLOBAL_ENDPOINT
    )]
    pub global_endpoint: Uri,

    /// Request timeout in milliseconds
    #[arg(
        env = "PROVISION_TPM_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "59000"
    )]
    pub request_timeout: Duration,
}

pub fn try_parse() -> Result<Cli, clap::Error> {
    Cli::try_parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn positional_arguments_are_optional() {
        let cli = Cli::try_parse_from(["provision-tpm"]).unwrap();
        assert_eq!(cli.id_scope, None);
        assert_eq!(cli.skip_test, None);
        assert_eq!(cli.tcti, "device:/dev/tpmrm0");
        assert_eq!(cli.request_timeout, Duration::from_millis(59_000));
        assert_eq!(
            cli.global_endpoint.host(),
            Some("global.azure-devices-provisioning.net")
        );
    }

    #[test]
    fn parses_positionals_and_options() {
        let cli = Cli::try_parse_from([
            "provision-tpm",
            "--tcti",
            "mssim:host=localhost,port=2321",
            "--request-timeout-ms",
            "1500",
            "0ne000",
            "edge-01",
            "edge-01",
            "n",
        ])
        .unwrap();
        assert_eq!(cli.id_scope.as_deref(), Some("0ne000"));
        assert_eq!(cli.registration_id.as_deref(), Some("edge-01"));
        assert_eq!(cli.device_id.as_deref(), Some("edge-01"));
        assert_eq!(cli.skip_test.as_deref(), Some("n"));
        assert_eq!(cli.tcti, "mssim:host=localhost,port=2321");
        assert_eq!(cli.request_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_extra_arguments() {
        assert!(Cli::try_parse_from(["provision-tpm", "a", "b", "c", "d", "e"]).is_err());
    }
}
