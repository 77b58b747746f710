use std::sync::Arc;

use crate::backend::InferenceBackend;
use crate::config::GpuConfig;

pub type DeviceId = usize;

pub const PINNED_DEVICE: DeviceId = 0;
pub const SWAP_DEVICE: DeviceId = 1;

/// Safety margin subtracted from every availability computation, on top of
/// the per-device reservation.
const SAFETY_GB: f64 = 1.0;

/// Models larger than this prefer the swap device on dual-GPU systems.
const LARGE_MODEL_GB: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub port: u16,
    pub total_gb: f64,
    /// Untouchable slack, typically 1 GB, plus any pinned-model reservation.
    pub reserved_gb: f64,
}

/// Build the device list from GPU configuration. Device 0 is always the
/// pinned device; device 1 exists only on dual-GPU systems.
pub fn devices_from_config(gpu: &GpuConfig) -> Vec<Device> {
    let mut devices = vec![Device {
        id: PINNED_DEVICE,
        port: gpu.pinned_port,
        total_gb: gpu.pinned_gpu_vram,
        reserved_gb: 1.0 + gpu.pinned_models_vram,
    }];
    if gpu.dual_gpu {
        devices.push(Device {
            id: SWAP_DEVICE,
            port: gpu.swap_port,
            total_gb: gpu.swap_gpu_vram,
            reserved_gb: 1.0,
        });
    }
    devices
}

/// Pure fit predicate: does a model of `size_gb` fit in `available_gb`?
pub fn fits(size_gb: f64, available_gb: f64) -> bool {
    size_gb <= available_gb
}

/// Per-device memory budget, read through to the live backend on every
/// query. Availability is never cached within an attempt; a cached value
/// would double-count phantom allocations made by concurrent jobs.
pub struct VramBudget {
    backend: Arc<dyn InferenceBackend>,
    devices: Vec<Device>,
}

impl VramBudget {
    pub fn new(backend: Arc<dyn InferenceBackend>, devices: Vec<Device>) -> Self {
        Self { backend, devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn port_of(&self, id: DeviceId) -> Option<u16> {
        self.device(id).map(|d| d.port)
    }

    /// capacity - reserved - sum(resident) - 1 GB safety. An unreachable
    /// device reports zero availability rather than an error: placement
    /// simply refuses it.
    pub async fn available_on(&self, id: DeviceId) -> f64 {
        let Some(device) = self.device(id) else {
            return 0.0;
        };
        let resident: f64 = match self.backend.list_running(device.port).await {
            Ok(models) => models.iter().map(|m| m.resident_gb).sum(),
            Err(e) => {
                tracing::warn!(device = id, "resident-model probe failed: {e}");
                return 0.0;
            }
        };
        (device.total_gb - device.reserved_gb - resident - SAFETY_GB).max(0.0)
    }

    /// Whether a model of `size_gb` currently fits on the device.
    pub async fn fits_on(&self, size_gb: f64, id: DeviceId) -> bool {
        fits(size_gb, self.available_on(id).await)
    }

    /// Route a model to a device. Dual-device systems send any model over
    /// 10 GB to the swap device when possible; smaller models stay pinned
    /// when they fit. Pinned models are never evicted; a placement that
    /// would require eviction is refused (`None`).
    pub async fn placement_for(&self, size_gb: f64) -> Option<DeviceId> {
        if self.devices.len() == 1 {
            return self
                .fits_on(size_gb, PINNED_DEVICE)
                .await
                .then_some(PINNED_DEVICE);
        }

        if size_gb > LARGE_MODEL_GB {
            if self.fits_on(size_gb, SWAP_DEVICE).await {
                return Some(SWAP_DEVICE);
            }
            return self
                .fits_on(size_gb, PINNED_DEVICE)
                .await
                .then_some(PINNED_DEVICE);
        }

        if self.fits_on(size_gb, PINNED_DEVICE).await {
            return Some(PINNED_DEVICE);
        }
        self.fits_on(size_gb, SWAP_DEVICE)
            .await
            .then_some(SWAP_DEVICE)
    }
}
