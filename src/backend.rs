//! Backend selection.
//!
//! The ndarray backend is the default so the crate trains and tests on any
//! host; the `cuda` feature switches the default device to the first GPU.

use burn::backend::Autodiff;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

/// The autodiff backend used for training.
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device for the selected backend.
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    #[cfg(feature = "cuda")]
    {
        burn_cuda::CudaDevice::default()
    }
    #[cfg(not(feature = "cuda"))]
    {
        Default::default()
    }
}

/// Human-readable name for the active backend.
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "ndarray (CPU)"
    }
}
