//! kNN embedding fusion and gradient scaling.
use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which branches get blended with their retrieved neighbour embedding.
///
/// Only [`KnnMode::MolPro`] changes the classification-head input; the
/// single-branch modes leave the pooled embeddings untouched.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KnnMode {
    #[default]
    No,
    Mol,
    Pro,
    MolPro,
}

/// Blend weights for the two branches and the global scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub mode: KnnMode,
    /// Weight of the molecule's own embedding, in [0, 1].
    pub molecule_weight: f64,
    /// Weight of the protein's own embedding, in [0, 1].
    pub protein_weight: f64,
    pub alpha: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            mode: KnnMode::No,
            molecule_weight: 0.8,
            protein_weight: 0.8,
            alpha: 0.707,
        }
    }
}

impl FusionParams {
    pub fn with_mode(mode: KnnMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Retrieved neighbour embeddings, `[batch, embed_dim]` each.
#[derive(Debug, Clone, Default)]
pub struct KnnEmbeddings {
    pub molecule: Option<Tensor>,
    pub protein: Option<Tensor>,
}

impl KnnEmbeddings {
    pub fn new(molecule: Tensor, protein: Tensor) -> Self {
        Self {
            molecule: Some(molecule),
            protein: Some(protein),
        }
    }
}

/// `alpha * (w * own + (1 - w) * knn)`.
///
/// An absent neighbour contributes nothing, leaving `alpha * w * own`.
pub fn knn_blend(own: &Tensor, knn: Option<&Tensor>, weight: f64, alpha: f64) -> Result<Tensor> {
    let own_part = (own * weight)?;
    let blended = match knn {
        Some(knn) => {
            let knn = knn.to_device(own.device())?.to_dtype(own.dtype())?;
            own_part.broadcast_add(&(knn * (1.0 - weight))?)?
        }
        None => own_part,
    };
    blended * alpha
}

/// Identity in the forward pass; scales the gradient flowing back through `x`.
pub fn grad_multiply(x: &Tensor, scale: f64) -> Result<Tensor> {
    if scale == 1.0 {
        return Ok(x.clone());
    }
    (x * scale)? + (x.detach() * (1.0 - scale))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use std::str::FromStr;

    #[test]
    fn test_blend_formula() -> Result<()> {
        let dev = Device::Cpu;
        let e = Tensor::new(&[[1f32, -2.0, 0.5]], &dev)?;
        let k = Tensor::new(&[[3f32, 4.0, -1.0]], &dev)?;
        let fused = knn_blend(&e, Some(&k), 0.8, 0.707)?.to_vec2::<f32>()?;
        let e = e.to_vec2::<f32>()?;
        let k = k.to_vec2::<f32>()?;
        for i in 0..3 {
            let expected = 0.707 * (0.8 * e[0][i] + 0.2 * k[0][i]);
            assert!((fused[0][i] - expected).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_absent_neighbour_is_zero_contribution() -> Result<()> {
        let e = Tensor::new(&[[2f32, 4.0]], &Device::Cpu)?;
        let fused = knn_blend(&e, None, 0.5, 1.0)?.to_vec2::<f32>()?;
        assert_eq!(fused, vec![vec![1.0, 2.0]]);
        Ok(())
    }

    #[test]
    fn test_grad_multiply_scales_gradient_only() -> Result<()> {
        let x = Var::new(&[1f32, 2.0, 3.0], &Device::Cpu)?;
        let y = grad_multiply(x.as_tensor(), 0.1)?;
        let values = y.to_vec1::<f32>()?;
        for (v, e) in values.iter().zip([1f32, 2.0, 3.0]) {
            assert!((v - e).abs() < 1e-6);
        }
        let grads = y.sum_all()?.backward()?;
        let g = grads.get(&x).expect("gradient").to_vec1::<f32>()?;
        for v in g {
            assert!((v - 0.1).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(KnnMode::from_str("mol_pro").unwrap(), KnnMode::MolPro);
        assert_eq!(KnnMode::Pro.to_string(), "pro");
    }
}
