//! Attention over the encoder outputs.
//!
//! An [`Attention`] scores every source position against a query vector, the scores are
//! turned into weights with a masked softmax and the weights are used to average the keys.
use candle::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// Similarity function used to build the attended context.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionConfig {
    DotProduct,
    Bilinear {
        #[serde(default)]
        activation: Option<candle_nn::Activation>,
    },
    Additive,
    Cosine,
}

pub trait Attention: std::fmt::Debug {
    /// Unnormalized similarity between `query` of shape `(batch, query_dim)` and `keys` of
    /// shape `(batch, src_len, key_dim)`, returns a tensor of shape `(batch, src_len)`.
    fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor>;

    /// Attention weights of shape `(batch, src_len)`, summing to one over the positions
    /// where `mask` is set and exactly zero elsewhere.
    fn weights(&self, query: &Tensor, keys: &Tensor, mask: &Tensor) -> Result<Tensor> {
        check_shapes(query, keys, mask)?;
        let scores = self.scores(query, keys)?;
        masked_softmax(&scores, mask)
    }

    /// The weighted sum of `keys`, shape `(batch, key_dim)`.
    fn attend(&self, query: &Tensor, keys: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let weights = self.weights(query, keys, mask)?;
        weighted_sum(keys, &weights)
    }
}

fn check_shapes(query: &Tensor, keys: &Tensor, mask: &Tensor) -> Result<()> {
    let (q_b, _) = query.dims2()?;
    let (k_b, src_len, _) = keys.dims3()?;
    let (m_b, m_len) = mask.dims2()?;
    if q_b != k_b || k_b != m_b || src_len != m_len {
        candle::bail!(
            "attention shape mismatch, query {:?}, keys {:?}, mask {:?}",
            query.shape(),
            keys.shape(),
            mask.shape()
        )
    }
    Ok(())
}

/// Replaces the scores at the positions where `mask` is zero with `value`.
fn masked_fill(scores: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let fill = Tensor::new(value, scores.device())?.broadcast_as(scores.shape())?;
    mask.where_cond(scores, &fill)
}

/// Softmax over the last dimension restricted to the positions where `mask` is non-zero,
/// computed in f32.
///
/// A row without any valid position gets all-zero weights.
pub fn masked_softmax(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let scores = scores.to_dtype(DType::F32)?;
    let mask = mask.ne(&mask.zeros_like()?)?;
    // f32::MIN rather than -inf keeps fully masked rows finite.
    let scores = masked_fill(&scores, &mask, f32::MIN)?;
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let probs = (probs * mask.to_dtype(DType::F32)?)?;
    let norm = (probs.sum_keepdim(D::Minus1)? + 1e-13)?;
    probs.broadcast_div(&norm)
}

/// `(batch, src_len, dim)` x `(batch, src_len)` -> `(batch, dim)`
pub fn weighted_sum(keys: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let weights = weights.to_dtype(keys.dtype())?.unsqueeze(1)?;
    weights.matmul(&keys.contiguous()?)?.squeeze(1)
}

#[derive(Debug, Clone)]
pub struct DotProductAttention {
    span: tracing::Span,
}

impl DotProductAttention {
    pub fn new() -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "dot-product-attn");
        Self { span }
    }
}

impl Default for DotProductAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl Attention for DotProductAttention {
    fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let query = query.to_dtype(keys.dtype())?.unsqueeze(2)?;
        keys.contiguous()?.matmul(&query)?.squeeze(2)
    }
}

#[derive(Debug, Clone)]
pub struct BilinearAttention {
    weight: Tensor,
    bias: Tensor,
    activation: Option<candle_nn::Activation>,
    span: tracing::Span,
}

impl BilinearAttention {
    pub fn new(
        query_dim: usize,
        key_dim: usize,
        activation: Option<candle_nn::Activation>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = (6.0 / (query_dim + key_dim) as f64).sqrt();
        let weight = vb.get_with_hints(
            (query_dim, key_dim),
            "weight",
            candle_nn::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(1, "bias", candle_nn::Init::Const(0.))?;
        let span = tracing::span!(tracing::Level::TRACE, "bilinear-attn");
        Ok(Self {
            weight,
            bias,
            activation,
            span,
        })
    }
}

impl Attention for BilinearAttention {
    fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let dtype = self.weight.dtype();
        let intermediate = query.to_dtype(dtype)?.matmul(&self.weight)?.unsqueeze(2)?;
        let scores = keys
            .to_dtype(dtype)?
            .contiguous()?
            .matmul(&intermediate)?
            .squeeze(2)?
            .broadcast_add(&self.bias)?;
        match &self.activation {
            None => Ok(scores),
            Some(activation) => activation.forward(&scores),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdditiveAttention {
    w_matrix: Tensor,
    u_matrix: Tensor,
    v_vector: Tensor,
    span: tracing::Span,
}

impl AdditiveAttention {
    pub fn new(query_dim: usize, key_dim: usize, vb: VarBuilder) -> Result<Self> {
        let init = |fan_in: usize, fan_out: usize| {
            let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
            candle_nn::Init::Uniform {
                lo: -bound,
                up: bound,
            }
        };
        let w_matrix = vb.get_with_hints(
            (query_dim, key_dim),
            "w_matrix",
            init(query_dim, key_dim),
        )?;
        let u_matrix = vb.get_with_hints((key_dim, key_dim), "u_matrix", init(key_dim, key_dim))?;
        let v_vector = vb.get_with_hints((key_dim, 1), "v_vector", init(key_dim, 1))?;
        let span = tracing::span!(tracing::Level::TRACE, "additive-attn");
        Ok(Self {
            w_matrix,
            u_matrix,
            v_vector,
            span,
        })
    }
}

impl Attention for AdditiveAttention {
    fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let dtype = self.w_matrix.dtype();
        let from_query = query.to_dtype(dtype)?.matmul(&self.w_matrix)?.unsqueeze(1)?;
        let from_keys = keys
            .to_dtype(dtype)?
            .contiguous()?
            .broadcast_matmul(&self.u_matrix)?;
        from_keys
            .broadcast_add(&from_query)?
            .tanh()?
            .broadcast_matmul(&self.v_vector)?
            .squeeze(2)
    }
}

#[derive(Debug, Clone)]
pub struct CosineAttention {
    span: tracing::Span,
}

impl CosineAttention {
    pub fn new() -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "cosine-attn");
        Self { span }
    }
}

impl Default for CosineAttention {
    fn default() -> Self {
        Self::new()
    }
}

fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = (xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()? + 1e-13)?;
    xs.broadcast_div(&norm)
}

impl Attention for CosineAttention {
    fn scores(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let query = l2_normalize(&query.to_dtype(keys.dtype())?)?.unsqueeze(2)?;
        let keys = l2_normalize(keys)?;
        keys.contiguous()?.matmul(&query)?.squeeze(2)
    }
}

/// Builds the attention scorer described by `cfg`.
pub fn attention(
    cfg: &AttentionConfig,
    query_dim: usize,
    key_dim: usize,
    vb: VarBuilder,
) -> Result<Box<dyn Attention>> {
    let attention: Box<dyn Attention> = match cfg {
        AttentionConfig::DotProduct | AttentionConfig::Cosine if query_dim != key_dim => {
            candle::bail!(
                "{cfg:?} attention needs matching query and key dims, got {query_dim} and {key_dim}"
            )
        }
        AttentionConfig::DotProduct => Box::new(DotProductAttention::new()),
        AttentionConfig::Cosine => Box::new(CosineAttention::new()),
        AttentionConfig::Bilinear { activation } => Box::new(BilinearAttention::new(
            query_dim,
            key_dim,
            *activation,
            vb,
        )?),
        AttentionConfig::Additive => Box::new(AdditiveAttention::new(query_dim, key_dim, vb)?),
    };
    Ok(attention)
}
