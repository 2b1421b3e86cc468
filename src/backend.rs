//! Backend selection
//!
//! NdArray (CPU) by default; the `wgpu` or `cuda` feature switches to a GPU
//! backend. CUDA wins when both GPU features are enabled.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
pub type DefaultBackend = burn::backend::Wgpu;

#[cfg(all(not(feature = "cuda"), not(feature = "wgpu"), feature = "ndarray"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "wgpu"), not(feature = "ndarray")))]
compile_error!("At least one backend (ndarray, wgpu, or cuda) must be enabled!");

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Human-readable name of the compiled-in backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "wgpu"))]
    {
        "WGPU (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), not(feature = "wgpu")))]
    {
        "NdArray (CPU)"
    }
}
