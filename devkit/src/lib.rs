/*!
# AirWatch DevKit - Test support for the AirWatch kernel

Drives the ingestion pipeline without a broker:
- `MockMqttClient`: records subscriptions and publishes, implements the
  kernel's transport traits, can be switched to fail
- `SensorMessageBuilder`: device payloads in the current and legacy shapes
- `TestHarness`: an Ingestion Loop wired to the mock, fed through channels
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMqttClient, SensorMessageBuilder};
pub use test_utils::TestHarness;
