/*
Device side of provisioning.

Registers the device with the DPS global endpoint using TPM attestation and,
once an IoT Hub is assigned, checks connectivity by publishing a test message
to the hub. All attestation and signing goes through the `TpmSecurity` trait
so the clients never see key material.
*/

mod registration;
mod telemetry;

pub use registration::{
    API_VERSION, DEFAULT_GLOBAL_ENDPOINT, ProvisioningDeviceClient, RegistrationError,
    RegistrationResult, RegistrationStatus,
};
pub use telemetry::{
    HUB_API_VERSION, TEST_MESSAGE, TelemetryError, device_sas_token, events_topic,
    mqtt_username, send_test_message,
};

use provision_util as util;
