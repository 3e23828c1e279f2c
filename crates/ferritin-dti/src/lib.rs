//! ferritin-dti
//!
//! Drug-target interaction prediction with two pretrained RoBERTa encoders,
//! one over molecule tokens and one over protein tokens, whose pooled
//! embeddings can be blended with retrieved kNN neighbour embeddings.
//!
//! ```shell
//! cargo run --example dti -- --cpu
//! cargo run --example dti --features metal
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

pub use config::{ActivationFn, DtiConfig};
pub use dti::{
    Branch, ClassificationHead, DtiInput, DtiModel, DtiOutput, ForwardArgs, FreezePolicy,
    FusionParams, HeadSpec, KnnEmbeddings, KnnMode, PretrainedEncoder,
};
pub use error::{DtiError, Result};
pub use hub::{Dictionary, DtiHubInterface};
pub use registry::ArchitectureRegistry;
pub use roberta::{RobertaEncoder, RobertaEncoderConfig};

pub mod config;
pub mod dti;
pub mod error;
pub mod hub;
pub mod registry;
pub mod roberta;
pub mod types;

pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}
