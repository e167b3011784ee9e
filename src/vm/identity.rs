//! Persisted machine identity.
//!
//! The identifier binds the installed guest to this bundle. It is generated
//! once, written to disk before anything uses it, and reused on every later
//! configuration build. A regenerated identifier would no longer match the
//! guest installed on the disk.

use std::fs;
use std::io;

use tracing::{info, warn};

use crate::engine::Hypervisor;
use crate::vm::HardwareModel;
use crate::vm::bundle::{BundleLocation, write_synced};
use crate::vm::error::{VmError, VmResult};

/// Identifier plus the hardware model it was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub identifier: Vec<u8>,
    pub hardware_model: HardwareModel,
}

/// Load the bundle's identity, creating and persisting it on first use.
///
/// `model` is the hardware model of the current requirements. It seeds a new
/// identity; an existing identity keeps the model it was persisted with.
pub fn load_or_create(
    location: &BundleLocation,
    hypervisor: &dyn Hypervisor,
    model: &HardwareModel,
) -> VmResult<MachineIdentity> {
    match fs::read(&location.machine_identifier) {
        Ok(identifier) => load_existing(location, identifier, model),
        Err(e) if e.kind() == io::ErrorKind::NotFound => create(location, hypervisor, model),
        Err(e) => Err(VmError::storage(&location.machine_identifier, e)),
    }
}

fn load_existing(
    location: &BundleLocation,
    identifier: Vec<u8>,
    model: &HardwareModel,
) -> VmResult<MachineIdentity> {
    if identifier.is_empty() {
        return Err(VmError::storage(
            &location.machine_identifier,
            io::Error::new(io::ErrorKind::InvalidData, "machine identifier file is empty"),
        ));
    }

    let hardware_model = match fs::read(&location.hardware_model) {
        Ok(bytes) if !bytes.is_empty() => {
            let persisted = HardwareModel(bytes);
            if &persisted != model {
                warn!("image hardware model differs from the persisted one; keeping persisted model");
            }
            persisted
        }
        Ok(_) => persist_model(location, model)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => persist_model(location, model)?,
        Err(e) => return Err(VmError::storage(&location.hardware_model, e)),
    };

    info!(path = %location.machine_identifier.display(), "reusing machine identity");
    Ok(MachineIdentity {
        identifier,
        hardware_model,
    })
}

fn create(
    location: &BundleLocation,
    hypervisor: &dyn Hypervisor,
    model: &HardwareModel,
) -> VmResult<MachineIdentity> {
    let identifier = hypervisor.new_machine_identifier();
    let hardware_model = persist_model(location, model)?;

    // The identifier file is the "identity exists" marker, so it goes last.
    write_synced(&location.machine_identifier, &identifier)
        .map_err(|e| VmError::storage(&location.machine_identifier, e))?;

    info!(path = %location.machine_identifier.display(), "generated new machine identity");
    Ok(MachineIdentity {
        identifier,
        hardware_model,
    })
}

fn persist_model(location: &BundleLocation, model: &HardwareModel) -> VmResult<HardwareModel> {
    write_synced(&location.hardware_model, model.as_bytes())
        .map_err(|e| VmError::storage(&location.hardware_model, e))?;
    Ok(model.clone())
}
