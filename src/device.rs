//! Catalogue of the supported wallet models and their GATT layout.
//!
//! All models share one 128-bit UUID template, `13D63400-2C97-xxxx-yyyy-4C6564676572`,
//! where `xxxx` selects the model family and `yyyy` the role: `0000` service,
//! `0001` notify, `0002` write-with-response, `0003` write-without-response.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The wallet models this transport knows how to talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    NanoX,
    Flex,
    Stax,
    Lynx,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 4] = [
        DeviceModel::NanoX,
        DeviceModel::Flex,
        DeviceModel::Stax,
        DeviceModel::Lynx,
    ];
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceModel::NanoX => "Nano X",
            DeviceModel::Flex => "Flex",
            DeviceModel::Stax => "Stax",
            DeviceModel::Lynx => "Lynx",
        };
        f.write_str(name)
    }
}

/// GATT layout of one wallet model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSpec {
    pub model: DeviceModel,
    pub service_uuid: Uuid,
    pub notify_uuid: Uuid,
    pub write_uuid: Uuid,
    pub write_cmd_uuid: Uuid,
}

pub const DEVICE_SPECS: &[DeviceSpec] = &[
    DeviceSpec {
        model: DeviceModel::NanoX,
        service_uuid: Uuid::from_u128(0x13d63400_2c97_0004_0000_4c6564676572),
        notify_uuid: Uuid::from_u128(0x13d63400_2c97_0004_0001_4c6564676572),
        write_uuid: Uuid::from_u128(0x13d63400_2c97_0004_0002_4c6564676572),
        write_cmd_uuid: Uuid::from_u128(0x13d63400_2c97_0004_0003_4c6564676572),
    },
    DeviceSpec {
        model: DeviceModel::Flex,
        service_uuid: Uuid::from_u128(0x13d63400_2c97_3004_0000_4c6564676572),
        notify_uuid: Uuid::from_u128(0x13d63400_2c97_3004_0001_4c6564676572),
        write_uuid: Uuid::from_u128(0x13d63400_2c97_3004_0002_4c6564676572),
        write_cmd_uuid: Uuid::from_u128(0x13d63400_2c97_3004_0003_4c6564676572),
    },
    DeviceSpec {
        model: DeviceModel::Stax,
        service_uuid: Uuid::from_u128(0x13d63400_2c97_6004_0000_4c6564676572),
        notify_uuid: Uuid::from_u128(0x13d63400_2c97_6004_0001_4c6564676572),
        write_uuid: Uuid::from_u128(0x13d63400_2c97_6004_0002_4c6564676572),
        write_cmd_uuid: Uuid::from_u128(0x13d63400_2c97_6004_0003_4c6564676572),
    },
    DeviceSpec {
        model: DeviceModel::Lynx,
        service_uuid: Uuid::from_u128(0x13d63400_2c97_4004_0000_4c6564676572),
        notify_uuid: Uuid::from_u128(0x13d63400_2c97_4004_0001_4c6564676572),
        write_uuid: Uuid::from_u128(0x13d63400_2c97_4004_0002_4c6564676572),
        write_cmd_uuid: Uuid::from_u128(0x13d63400_2c97_4004_0003_4c6564676572),
    },
];

impl DeviceSpec {
    /// Look up the spec for a model.
    pub fn for_model(model: DeviceModel) -> &'static DeviceSpec {
        // DEVICE_SPECS covers every DeviceModel variant.
        DEVICE_SPECS
            .iter()
            .find(|spec| spec.model == model)
            .expect("device catalogue covers every model")
    }

    /// Match an advertised service UUID against the catalogue.
    pub fn for_service(service_uuid: &Uuid) -> Option<&'static DeviceSpec> {
        DEVICE_SPECS.iter().find(|spec| spec.service_uuid == *service_uuid)
    }

    /// The characteristic outbound APDU frames should be written to.
    ///
    /// Prefers the write-without-response characteristic when the peripheral
    /// actually exposes that capability.
    pub fn write_characteristic_uuid(&self, can_write_without_response: bool) -> Uuid {
        if can_write_without_response {
            self.write_cmd_uuid
        } else {
            self.write_uuid
        }
    }
}

/// Which wallet models the scanner should accept. Defaults to all of them.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    models: Vec<DeviceModel>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            models: DeviceModel::ALL.to_vec(),
        }
    }
}

impl TransportConfig {
    /// Restrict scanning to a subset of models. An empty subset falls back to
    /// the full catalogue: a transport that can match nothing is useless.
    pub fn with_models(models: &[DeviceModel]) -> Self {
        if models.is_empty() {
            return Self::default();
        }
        let mut seen = Vec::new();
        for model in models {
            if !seen.contains(model) {
                seen.push(*model);
            }
        }
        Self { models: seen }
    }

    pub fn models(&self) -> &[DeviceModel] {
        &self.models
    }

    /// Service UUIDs to filter advertisements with.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.models
            .iter()
            .map(|model| DeviceSpec::for_model(*model).service_uuid)
            .collect()
    }

    /// Match an advertised service UUID against the configured subset.
    pub fn match_service(&self, service_uuid: &Uuid) -> Option<&'static DeviceSpec> {
        DeviceSpec::for_service(service_uuid).filter(|spec| self.models.contains(&spec.model))
    }
}
