use serde::{Deserialize, Serialize};

use crate::util::types::{DeviceId, RegistrationId};

/*
    individualEnrollment {
        registrationId
        deviceId?
        attestation { type, tpm?, x509?, symmetricKey? }
        capabilities? { iotEdge }
        provisioningStatus?
        iotHubHostName?
        etag?
        createdDateTimeUtc?      (read-only)
        lastUpdatedDateTimeUtc?  (read-only)
        registrationState?       (read-only)
    }
*/

/// Individual enrollment record, keyed by registration id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndividualEnrollment {
    pub registration_id: RegistrationId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,

    pub attestation: AttestationMechanism,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<DeviceCapabilities>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_status: Option<ProvisioningStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iot_hub_host_name: Option<String>,

    /// Set to update an existing record only if it has not changed since
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_date_time_utc: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_date_time_utc: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<serde_json::Value>,
}

impl IndividualEnrollment {
    pub fn new(registration_id: RegistrationId, attestation: AttestationMechanism) -> Self {
        Self {
            registration_id,
            device_id: None,
            attestation,
            capabilities: None,
            provisioning_status: None,
            iot_hub_host_name: None,
            etag: None,
            created_date_time_utc: None,
            last_updated_date_time_utc: None,
            registration_state: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AttestationMechanism {
    Tpm { tpm: TpmAttestation },
}

impl AttestationMechanism {
    /// TPM attestation with a base64 encoded endorsement key
    pub fn tpm(endorsement_key: impl Into<String>) -> Self {
        Self::Tpm {
            tpm: TpmAttestation {
                endorsement_key: endorsement_key.into(),
                storage_root_key: None,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TpmAttestation {
    pub endorsement_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_root_key: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub iot_edge: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Enabled,
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn serializes_tpm_enrollment() {
        let mut enrollment =
            IndividualEnrollment::new("edge-01".parse().unwrap(), AttestationMechanism::tpm("AToA"));
        enrollment.device_id = Some("EDGE-01".into());
        enrollment.capabilities = Some(DeviceCapabilities { iot_edge: true });
        enrollment.provisioning_status = Some(ProvisioningStatus::Enabled);

        assert_eq!(
            serde_json::to_value(&enrollment).unwrap(),
            json!({
                "registrationId": "edge-01",
                "deviceId": "EDGE-01",
                "attestation": {"type": "tpm", "tpm": {"endorsementKey": "AToA"}},
                "capabilities": {"iotEdge": true},
                "provisioningStatus": "enabled"
            })
        );
    }

    #[test]
    fn deserializes_service_response() {
        let enrollment: IndividualEnrollment = serde_json::from_value(json!({
            "registrationId": "edge-01",
            "deviceId": "EDGE-01",
            "attestation": {
                "type": "tpm",
                "tpm": {"endorsementKey": "AToA", "storageRootKey": null},
                "x509": null,
                "symmetricKey": null
            },
            "capabilities": {"iotEdge": true},
            "provisioningStatus": "enabled",
            "etag": "\"0400c7d8-0000-0000-0000-000000000000\"",
            "createdDateTimeUtc": "2024-01-01T00:00:00.000Z",
            "lastUpdatedDateTimeUtc": "2024-01-01T00:00:00.000Z",
            "allocationPolicy": "hashed"
        }))
        .unwrap();

        assert_eq!(enrollment.attestation, AttestationMechanism::tpm("AToA"));
        assert_eq!(
            enrollment.etag.as_deref(),
            Some("\"0400c7d8-0000-0000-0000-000000000000\"")
        );
        assert_eq!(enrollment.provisioning_status, Some(ProvisioningStatus::Enabled));
    }
}
