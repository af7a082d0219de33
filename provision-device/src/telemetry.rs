use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS, Transport};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::util::sas::{DEFAULT_TTL, SasToken, expiry_from_now};
use crate::util::security::TpmSecurity;
use crate::util::types::DeviceId;

/// IoT Hub API version announced in the MQTT user name
pub const HUB_API_VERSION: &str = "2021-04-12";

/// Payload of the connectivity test message
pub const TEST_MESSAGE: &str = "TestMessage";

const MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Security provider failed: {0}")]
    Security(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to queue message: {0}")]
    Client(#[from] ClientError),

    #[error("Connection to hub failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Hub did not acknowledge the message within {0:?}")]
    Timeout(Duration),
}

/// MQTT user name for a device connecting to `hub`
pub fn mqtt_username(hub: &str, device_id: &DeviceId) -> String {
    format!("{hub}/{device_id}/?api-version={HUB_API_VERSION}")
}

/// Topic device-to-cloud messages are published to
pub fn events_topic(device_id: &DeviceId) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Device token for `hub`, signed by the identity key in the TPM.
pub fn device_sas_token<S: TpmSecurity>(
    security: &mut S,
    hub: &str,
    device_id: &DeviceId,
    expiry: u64,
) -> Result<SasToken, S::Error> {
    SasToken::sign(&format!("{hub}/devices/{device_id}"), expiry, None, |data| {
        security.sign(data)
    })
}

/// Connect to the assigned hub as the device and publish a single test
/// message, returning once the hub has acknowledged it.
#[instrument(skip_all, fields(hub = hub, device_id = %device_id), err)]
pub async fn send_test_message<S: TpmSecurity>(
    security: &mut S,
    hub: &str,
    device_id: &DeviceId,
    timeout: Duration,
) -> Result<(), TelemetryError> {
    let token = device_sas_token(security, hub, device_id, expiry_from_now(DEFAULT_TTL))
        .map_err(|e| TelemetryError::Security(Box::new(e)))?;

    let mut options = MqttOptions::new(device_id.as_str(), hub, MQTT_PORT);
    options
        .set_credentials(mqtt_username(hub, device_id), token.to_string())
        .set_keep_alive(KEEP_ALIVE)
        .set_transport(Transport::tls_with_default_config());

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client
        .publish(events_topic(device_id), QoS::AtLeastOnce, false, TEST_MESSAGE)
        .await?;

    let exchange = async {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => debug!("connected"),
                Event::Incoming(Packet::PubAck(_)) => break,
                _ => {}
            }
        }
        debug!("message acknowledged");

        client.disconnect().await?;
        loop {
            if let Event::Outgoing(Outgoing::Disconnect) = eventloop.poll().await? {
                break;
            }
        }
        Ok::<_, TelemetryError>(())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TelemetryError::Timeout(timeout))?
}
