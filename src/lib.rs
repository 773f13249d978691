pub use coupling;
pub use coupling::*;
pub use layers;

use candle_core::Device;

pub fn setup_device() -> anyhow::Result<Device> {
    log::debug!(
        "starting device detection os={} arch={} cuda={}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        candle_core::utils::cuda_is_available()
    );

    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            if cuda_preflight(&device).is_ok() {
                log::info!("CUDA device selected: {:?}", device);
                return Ok(device);
            }
            log::warn!("CUDA device detected but preflight failed, falling back to CPU");
            Ok(Device::Cpu)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Runs the ops a coupling layer needs (conv, exp, per-sample sum) on `device`.
fn cuda_preflight(device: &Device) -> anyhow::Result<()> {
    use candle_core::{DType, Tensor};

    let x = Tensor::randn(0f32, 1.0, (2, 4, 8, 8), device)?;
    let kernel = Tensor::ones((8, 4, 3, 3), DType::F32, device)?;
    let _ = x.conv2d(&kernel, 1, 1, 1, 1)?;
    let _ = x.exp()?.flatten_from(1)?.sum(1)?;

    Ok(())
}
