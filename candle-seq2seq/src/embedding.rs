//! Target token embedding with a frozen padding row.
use candle::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

/// Embedding table whose padding row always embeds to zeros.
///
/// The padding row of the stored weights is multiplied by zero before the lookup, so it
/// never contributes to the output and never receives a gradient.
#[derive(Debug, Clone)]
pub struct PaddedEmbedding {
    embeddings: Tensor,
    row_mask: Tensor,
    vocab_size: usize,
    hidden_size: usize,
    padding_index: u32,
    span: tracing::Span,
}

impl PaddedEmbedding {
    pub fn new(embeddings: Tensor, padding_index: u32) -> Result<Self> {
        let (vocab_size, hidden_size) = embeddings.dims2()?;
        if padding_index as usize >= vocab_size {
            candle::bail!("padding index {padding_index} outside of the table ({vocab_size} rows)")
        }
        let mut mask = vec![1f32; vocab_size];
        mask[padding_index as usize] = 0.;
        let row_mask = Tensor::from_vec(mask, (vocab_size, 1), embeddings.device())?
            .to_dtype(embeddings.dtype())?;
        let span = tracing::span!(tracing::Level::TRACE, "target-embedding");
        Ok(Self {
            embeddings,
            row_mask,
            vocab_size,
            hidden_size,
            padding_index,
            span,
        })
    }

    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn padding_index(&self) -> u32 {
        self.padding_index
    }

    fn check_indexes(&self, indexes: &Tensor) -> Result<()> {
        let ids = indexes.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        if let Some(id) = ids
            .iter()
            .find(|&&id| id < 0 || id as usize >= self.vocab_size)
        {
            candle::bail!("token id {id} is outside of [0, {})", self.vocab_size)
        }
        Ok(())
    }
}

impl Module for PaddedEmbedding {
    fn forward(&self, indexes: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.check_indexes(indexes)?;
        let mut final_dims = indexes.dims().to_vec();
        final_dims.push(self.hidden_size);
        let indexes = indexes.flatten_all()?.to_dtype(DType::U32)?.contiguous()?;
        let table = self.embeddings.broadcast_mul(&self.row_mask)?;
        table.index_select(&indexes, 0)?.reshape(final_dims)
    }
}

pub fn padded_embedding(
    in_size: usize,
    out_size: usize,
    padding_index: u32,
    vb: VarBuilder,
) -> Result<PaddedEmbedding> {
    let embeddings = vb.get_with_hints(
        (in_size, out_size),
        "weight",
        candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        },
    )?;
    PaddedEmbedding::new(embeddings, padding_index)
}
