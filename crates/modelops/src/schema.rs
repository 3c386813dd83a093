use serde::{Deserialize, Serialize};

/// Where a loaded model executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    /// Resolve a device preference (`auto`, `cuda`, `cpu`) once at startup.
    /// `auto` picks CUDA only when an NVIDIA driver reports at least one GPU.
    pub fn detect(preference: &str) -> Device {
        match preference.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Device::Cuda,
            "cpu" => Device::Cpu,
            _ => {
                if nvidia_gpu_present() {
                    Device::Cuda
                } else {
                    Device::Cpu
                }
            }
        }
    }

    /// Maps the device name a runtime reports (`cuda`, `cuda:1`, `cpu`).
    pub fn from_reported(name: &str) -> Option<Device> {
        let name = name.trim().to_ascii_lowercase();
        if name == "cpu" {
            Some(Device::Cpu)
        } else if name == "gpu" || name == "cuda" || name.starts_with("cuda:") {
            Some(Device::Cuda)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn nvidia_gpu_present() -> bool {
    // CUDA_VISIBLE_DEVICES="" or "-1" hides every GPU from the runtime
    if let Ok(v) = std::env::var("CUDA_VISIBLE_DEVICES") {
        let v = v.trim();
        if v.is_empty() || v == "-1" {
            return false;
        }
    }
    std::fs::read_dir("/proc/driver/nvidia/gpus")
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float16,
    Float32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float16 => "float16",
            Precision::Float32 => "float32",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMap {
    /// Let the runtime spread layers across available accelerators.
    Auto,
    /// Place every layer on the CPU explicitly.
    Cpu,
}

impl DeviceMap {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMap::Auto => "auto",
            DeviceMap::Cpu => "cpu",
        }
    }
}

/// Precision + placement used when loading model weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub device: Device,
    pub precision: Precision,
    pub device_map: DeviceMap,
}

impl Placement {
    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Cuda => Placement {
                device,
                precision: Precision::Float16,
                device_map: DeviceMap::Auto,
            },
            Device::Cpu => Placement {
                device,
                precision: Precision::Float32,
                device_map: DeviceMap::Cpu,
            },
        }
    }
}

/// Snapshot of the slot plus a fresh registry scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub loaded: bool,
    pub model_name: Option<String>,
    pub device: Device,
    pub loaded_at: Option<chrono::DateTime<chrono::Utc>>,
    pub available_models: Vec<String>,
}
