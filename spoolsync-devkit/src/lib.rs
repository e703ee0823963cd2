/*!
SpoolSync DevKit - outils de test pour le lien imprimante

- `MockMqttClient` : publisher qui enregistre au lieu d'envoyer
- `ReportBuilder` : rapports JSON tels que l'imprimante les publie
- `TestHarness` : `PrinterClient` réel branché sur le mock
- `Capture` : rejeu de journaux MQTT enregistrés
*/

pub mod mqtt_stub;
pub mod replay;
pub mod test_utils;

pub use mqtt_stub::{command_of, MockMessage, MockMqttClient, ReportBuilder};
pub use replay::Capture;
pub use test_utils::{TestHarness, TestStats, DEFAULT_SERIAL, DUAL_SERIAL};
