//! Lookups on the BlueZ object tree and conversion into bridge models.

use std::collections::HashMap;

use bluer::{
   Adapter, Address, Device, ErrorKind,
   gatt::remote::{
      Characteristic as RemoteCharacteristic, Descriptor as RemoteDescriptor,
      Service as RemoteService,
   },
};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   adapter::{CharacteristicPath, DescriptorPath, MIN_ATT_MTU},
   model::{BleError, BleErrorCode, Characteristic, Descriptor, Peripheral, ScanResult, Service},
};

/// Wraps a BlueZ failure, preferring a more specific code when the error
/// kind identifies one.
pub fn ble_error(fallback: BleErrorCode, e: &bluer::Error) -> BleError {
   BleError::new(refine(fallback, &e.kind)).internal(e.to_string())
}

fn refine(fallback: BleErrorCode, kind: &ErrorKind) -> BleErrorCode {
   match kind {
      ErrorKind::AlreadyConnected => BleErrorCode::DeviceAlreadyConnected,
      ErrorKind::NotReady => BleErrorCode::BluetoothPoweredOff,
      ErrorKind::NotAuthorized => BleErrorCode::BluetoothUnauthorized,
      ErrorKind::ServicesUnresolved => BleErrorCode::ServicesNotDiscovered,
      _ => fallback,
   }
}

pub fn parse_address(device_id: &str) -> Result<Address, BleError> {
   device_id.parse().map_err(|_| {
      BleError::new(BleErrorCode::InvalidIdentifiers)
         .reason(format!("{device_id:?} is not a Bluetooth address"))
         .device(device_id)
   })
}

pub fn device(adapter: &Adapter, device_id: &str) -> Result<Device, BleError> {
   let address = parse_address(device_id)?;
   adapter
      .device(address)
      .map_err(|e| ble_error(BleErrorCode::DeviceNotFound, &e).device(device_id))
}

pub async fn connected_device(adapter: &Adapter, device_id: &str) -> Result<Device, BleError> {
   let device = device(adapter, device_id)?;
   match device.is_connected().await {
      Ok(true) => Ok(device),
      Ok(false) => Err(BleError::new(BleErrorCode::DeviceNotConnected)
         .reason("Device is not connected")
         .device(device_id)),
      Err(e) => Err(ble_error(BleErrorCode::DeviceNotFound, &e).device(device_id)),
   }
}

/// Fails unless BlueZ finished resolving the device's services.
pub async fn ensure_resolved(device: &Device, device_id: &str) -> Result<(), BleError> {
   match device.is_services_resolved().await {
      Ok(true) => Ok(()),
      Ok(false) => Err(BleError::new(BleErrorCode::ServicesNotDiscovered)
         .reason("Services were not discovered yet")
         .device(device_id)),
      Err(e) => Err(ble_error(BleErrorCode::ServicesDiscoveryFailed, &e).device(device_id)),
   }
}

pub async fn find_service(
   device: &Device,
   device_id: &str,
   uuid: Uuid,
) -> Result<RemoteService, BleError> {
   let services = device
      .services()
      .await
      .map_err(|e| ble_error(BleErrorCode::ServicesDiscoveryFailed, &e).device(device_id))?;
   for service in services {
      if service.uuid().await.ok() == Some(uuid) {
         return Ok(service);
      }
   }
   Err(BleError::new(BleErrorCode::ServiceNotFound)
      .device(device_id)
      .service(uuid))
}

pub async fn find_characteristic(
   adapter: &Adapter,
   path: &CharacteristicPath,
) -> Result<RemoteCharacteristic, BleError> {
   let device = connected_device(adapter, &path.device_identifier).await?;
   let service = find_service(&device, &path.device_identifier, path.service_uuid).await?;
   let not_found = || {
      BleError::new(BleErrorCode::CharacteristicNotFound)
         .device(path.device_identifier.clone())
         .service(path.service_uuid)
         .characteristic(path.characteristic_uuid)
   };
   let characteristics = service.characteristics().await.map_err(|e| {
      let error = ble_error(BleErrorCode::CharacteristicsDiscoveryFailed, &e);
      BleError { code: error.code, internal_message: error.internal_message, ..not_found() }
   })?;
   for characteristic in characteristics {
      if characteristic.uuid().await.ok() == Some(path.characteristic_uuid) {
         return Ok(characteristic);
      }
   }
   Err(not_found())
}

pub async fn find_descriptor(
   adapter: &Adapter,
   path: &DescriptorPath,
) -> Result<RemoteDescriptor, BleError> {
   let characteristic = find_characteristic(adapter, &path.characteristic).await?;
   let descriptors = characteristic
      .descriptors()
      .await
      .map_err(|e| descriptor_error(BleErrorCode::DescriptorsDiscoveryFailed, path, &e))?;
   for descriptor in descriptors {
      if descriptor.uuid().await.ok() == Some(path.descriptor_uuid) {
         return Ok(descriptor);
      }
   }
   Err(BleError::new(BleErrorCode::DescriptorNotFound)
      .device(path.characteristic.device_identifier.clone())
      .service(path.characteristic.service_uuid)
      .characteristic(path.characteristic.characteristic_uuid)
      .descriptor(path.descriptor_uuid))
}

pub fn characteristic_error(
   code: BleErrorCode,
   path: &CharacteristicPath,
   e: &bluer::Error,
) -> BleError {
   ble_error(code, e)
      .device(path.device_identifier.clone())
      .service(path.service_uuid)
      .characteristic(path.characteristic_uuid)
}

pub fn descriptor_error(code: BleErrorCode, path: &DescriptorPath, e: &bluer::Error) -> BleError {
   characteristic_error(code, &path.characteristic, e).descriptor(path.descriptor_uuid)
}

// === Models ===

pub async fn service_model(service: &RemoteService, device_id: &str) -> bluer::Result<Service> {
   Ok(Service {
      uuid: service.uuid().await?,
      device_identifier: device_id.into(),
      is_primary: service.primary().await?,
   })
}

pub async fn characteristic_model(
   characteristic: &RemoteCharacteristic,
   path: &CharacteristicPath,
   value: Option<Vec<u8>>,
) -> bluer::Result<Characteristic> {
   let flags = characteristic.flags().await?;
   Ok(Characteristic {
      uuid: path.characteristic_uuid,
      service_uuid: path.service_uuid,
      device_identifier: path.device_identifier.clone(),
      is_readable: flags.read,
      is_writable_with_response: flags.write,
      is_writable_without_response: flags.write_without_response,
      is_notifiable: flags.notify,
      is_indicatable: flags.indicate,
      value,
   })
}

pub fn descriptor_model(path: &DescriptorPath, value: Option<Vec<u8>>) -> Descriptor {
   Descriptor {
      uuid: path.descriptor_uuid,
      characteristic_uuid: path.characteristic.characteristic_uuid,
      service_uuid: path.characteristic.service_uuid,
      device_identifier: path.characteristic.device_identifier.clone(),
      value,
   }
}

pub async fn peripheral(device: &Device) -> Peripheral {
   Peripheral {
      identifier: SmolStr::new(device.address().to_string()),
      name: device.name().await.ok().flatten(),
   }
}

pub async fn scan_result(device: &Device) -> bluer::Result<ScanResult> {
   let mut service_uuids: Vec<Uuid> = device.uuids().await?.unwrap_or_default().into_iter().collect();
   service_uuids.sort_unstable();
   Ok(ScanResult {
      device_identifier: SmolStr::new(device.address().to_string()),
      name: device.name().await?,
      rssi: device.rssi().await?,
      tx_power_level: device.tx_power().await?,
      manufacturer_data: device
         .manufacturer_data()
         .await?
         .and_then(|data| manufacturer_bytes(&data)),
      service_data: device.service_data().await?.unwrap_or_default(),
      service_uuids,
   })
}

/// Flattens BlueZ's per-company map back into advertisement form: the
/// little-endian company id followed by its payload. Only the lowest company
/// id is kept when a device advertises several.
pub fn manufacturer_bytes(data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
   let (company, payload) = data.iter().min_by_key(|(company, _)| **company)?;
   let mut bytes = Vec::with_capacity(2 + payload.len());
   bytes.extend_from_slice(&company.to_le_bytes());
   bytes.extend_from_slice(payload);
   Some(bytes)
}

/// Current ATT MTU of a connected device, read from any of its
/// characteristics.
pub async fn current_mtu(device: &Device) -> bluer::Result<u16> {
   for service in device.services().await? {
      if let Some(characteristic) = service.characteristics().await?.first() {
         let mtu = characteristic.mtu().await?;
         return Ok(u16::try_from(mtu).unwrap_or(u16::MAX));
      }
   }
   Ok(MIN_ATT_MTU)
}
