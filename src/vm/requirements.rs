//! Hardware requirement resolution for a restore image.

use std::path::Path;

use tracing::info;

use crate::engine::{ConfigurationVariant, Hypervisor};
use crate::vm::HardwareRequirements;
use crate::vm::error::{VmError, VmResult};

/// Open `image` and return the requirements of the most capable configuration
/// this host supports.
///
/// Unreadable images and images without a supported variant both fail with
/// [`VmError::UnsupportedConfiguration`]; retrying needs a different image or
/// host.
pub async fn resolve(hypervisor: &dyn Hypervisor, image: &Path) -> VmResult<HardwareRequirements> {
    let info = hypervisor
        .inspect_image(image)
        .await
        .map_err(|e| VmError::UnsupportedConfiguration(e.to_string()))?;

    let variant = most_capable_supported(&info.variants).ok_or_else(|| {
        VmError::UnsupportedConfiguration(format!(
            "{} offers {} configuration(s), none supported by this host",
            image.display(),
            info.variants.len()
        ))
    })?;

    if variant.min_cpu == 0 || variant.min_memory_bytes == 0 {
        return Err(VmError::UnsupportedConfiguration(format!(
            "image reports nonsensical minimums (cpu {}, memory {})",
            variant.min_cpu, variant.min_memory_bytes
        )));
    }

    info!(
        revision = variant.revision,
        min_cpu = variant.min_cpu,
        min_memory_gib = variant.min_memory_bytes / crate::vm::GIB,
        "hardware requirements"
    );

    Ok(HardwareRequirements {
        min_cpu: variant.min_cpu,
        min_memory_bytes: variant.min_memory_bytes,
        hardware_model: variant.hardware_model.clone(),
    })
}

fn most_capable_supported(variants: &[ConfigurationVariant]) -> Option<&ConfigurationVariant> {
    variants
        .iter()
        .filter(|v| v.supported_by_host)
        .max_by_key(|v| v.revision)
}
