// Encoder argument construction, capability probing and progress parsing.

pub mod args;
pub mod capabilities;
pub mod progress;

pub use args::ArgumentBuilder;
pub use capabilities::{software_equivalent, EncoderCapabilities};
pub use progress::ProgressParser;

/// Error markers for the known hardware failure family. A launch failure
/// whose stderr matches one of these gets a single software-fallback retry.
const HARDWARE_ERROR_MARKERS: &[&str] = &[
    "cannot load libcuda",
    "cuda_error",
    "no nvenc capable devices",
    "nvenc api version",
    "failed to initialise vaapi",
    "failed to initialize vaapi",
    "vaapi_device",
    "no va display found",
    "device creation failed",
    "failed to set value 'cuda'",
    "hwaccel initialisation returned error",
    "hardware accelerator failed to initialize",
    "qsv requires a fixed frame pool size",
    "error initializing the mfx",
    "videotoolbox encoder not available",
];

/// Whether encoder output indicates a hardware-acceleration failure.
#[must_use]
pub fn is_hardware_error(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    HARDWARE_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
