/*
Client for the DPS service API.

This is the back-end side of provisioning: authenticated with a shared
access policy from the DPS connection string, it manages the enrollment
records that decide which devices may register and where they land.
*/

mod client;
mod connection;
mod enrollment;

pub use client::{API_VERSION, EnrollmentError, ProvisioningServiceClient};
pub use connection::{ConnectionStringError, ServiceConnectionString};
pub use enrollment::{
    AttestationMechanism, DeviceCapabilities, IndividualEnrollment, ProvisioningStatus,
    TpmAttestation,
};

use provision_util as util;
