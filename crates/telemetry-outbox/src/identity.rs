// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::constants::{DEVICE_ID_KEY, DEVICE_ID_TYPE_KEY};
use crate::errors::StoreError;
use crate::store::PersistentStore;

/// Where a device id came from. Serialized as the integer sent in the `t`
/// request parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeviceIdType {
    DeveloperSupplied,
    SdkGenerated,
}

impl From<DeviceIdType> for u8 {
    fn from(value: DeviceIdType) -> Self {
        match value {
            DeviceIdType::DeveloperSupplied => 0,
            DeviceIdType::SdkGenerated => 1,
        }
    }
}

impl TryFrom<u8> for DeviceIdType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceIdType::DeveloperSupplied),
            1 => Ok(DeviceIdType::SdkGenerated),
            other => Err(format!("unknown device id type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub device_id: String,
    pub id_type: DeviceIdType,
}

impl Identity {
    /// Resolves the identity at startup.
    ///
    /// A stored id wins, so an identity changed at runtime survives a
    /// restart. The developer supplied id is used when nothing is stored, or
    /// in place of the stored one when `clear_stored` is set. With neither a
    /// fresh id is generated. Any change is persisted right away.
    pub fn load_or_generate(
        store: &PersistentStore,
        developer_id: Option<&str>,
        clear_stored: bool,
    ) -> Result<Identity, StoreError> {
        let stored_id = store
            .get(DEVICE_ID_KEY, Value::Null)
            .as_str()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let stored_type: Option<DeviceIdType> = store.get_as(DEVICE_ID_TYPE_KEY, None);

        let identity = match (developer_id, stored_id) {
            (Some(id), None) => Identity {
                device_id: id.to_string(),
                id_type: DeviceIdType::DeveloperSupplied,
            },
            (Some(id), Some(_)) if clear_stored => {
                debug!("Replacing stored device id with the configured one");
                Identity {
                    device_id: id.to_string(),
                    id_type: DeviceIdType::DeveloperSupplied,
                }
            }
            (_, Some(id)) => Identity {
                device_id: id,
                id_type: stored_type.unwrap_or(DeviceIdType::SdkGenerated),
            },
            (None, None) => {
                let identity = Identity {
                    device_id: uuid::Uuid::new_v4().to_string(),
                    id_type: DeviceIdType::SdkGenerated,
                };
                debug!("Generated device id {}", identity.device_id);
                identity
            }
        };

        if store.get(DEVICE_ID_KEY, Value::Null).as_str() != Some(identity.device_id.as_str())
            || stored_type != Some(identity.id_type)
        {
            identity.persist(store)?;
        }
        Ok(identity)
    }

    pub fn persist(&self, store: &PersistentStore) -> Result<(), StoreError> {
        let _ = store.set(DEVICE_ID_KEY, Value::String(self.device_id.clone()));
        let _ = store.set_as(DEVICE_ID_TYPE_KEY, &self.id_type)?;
        Ok(())
    }
}
