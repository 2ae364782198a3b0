use candle::Result;

use crate::attention::AttentionConfig;
use crate::loss::LossAverage;

fn default_task() -> String {
    "seq2seq".to_string()
}

fn default_scheduled_sampling_ratio() -> f64 {
    0.0
}

fn default_use_bleu() -> bool {
    true
}

fn default_bleu_ngram_weights() -> Vec<f64> {
    vec![0.25, 0.25, 0.25, 0.25]
}

fn default_target_decoder_layers() -> usize {
    1
}

fn default_loss_weight() -> f64 {
    1.0
}

fn default_normalize_loss_by_vocab() -> bool {
    true
}

fn default_pad_index() -> u32 {
    0
}

fn default_start_index() -> u32 {
    2
}

fn default_end_index() -> u32 {
    3
}

/// Reserved ids of the target vocabulary.
///
/// The three ids must be distinct and stay fixed for the lifetime of a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct SpecialTokens {
    #[serde(default = "default_pad_index")]
    pub pad_index: u32,
    #[serde(default = "default_start_index")]
    pub start_index: u32,
    #[serde(default = "default_end_index")]
    pub end_index: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad_index: default_pad_index(),
            start_index: default_start_index(),
            end_index: default_end_index(),
        }
    }
}

impl SpecialTokens {
    pub fn new(pad_index: u32, start_index: u32, end_index: u32) -> Self {
        Self {
            pad_index,
            start_index,
            end_index,
        }
    }

    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        if self.start_index == self.end_index {
            candle::bail!(
                "start and end markers must differ, both are {}",
                self.start_index
            )
        }
        if self.pad_index == self.start_index || self.pad_index == self.end_index {
            candle::bail!(
                "padding id {} collides with the start ({}) or end ({}) marker",
                self.pad_index,
                self.start_index,
                self.end_index
            )
        }
        for (name, id) in [
            ("padding", self.pad_index),
            ("start", self.start_index),
            ("end", self.end_index),
        ] {
            if id as usize >= vocab_size {
                candle::bail!("{name} id {id} is outside the vocabulary (size {vocab_size})")
            }
        }
        Ok(())
    }
}

/// Configuration for [`crate::Seq2SeqDecoder`].
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DecoderConfig {
    /// Name used to scope the reported metrics.
    #[serde(default = "default_task")]
    pub task: String,
    /// Dimension of the encoder outputs.
    pub input_dim: usize,
    /// Extra dimensions appended to the encoder outputs (e.g. dataset embeddings).
    #[serde(default)]
    pub dataset_embeds_dim: usize,
    /// Hard upper bound on the number of decoding steps.
    pub max_decoding_steps: usize,
    /// Beam width, greedy decoding when unset.
    #[serde(default)]
    pub beam_size: Option<usize>,
    /// Number of candidates each hypothesis proposes before pruning, defaults to the beam width.
    #[serde(default)]
    pub per_node_beam_size: Option<usize>,
    /// Defaults to the decoder hidden size.
    #[serde(default)]
    pub target_embedding_dim: Option<usize>,
    #[serde(default)]
    pub attention: Option<AttentionConfig>,
    /// Probability of feeding the model's own previous prediction during training.
    ///
    /// A uniform draw in `[0, 1)` is taken at every step: if it is below this ratio the
    /// previous prediction is fed, otherwise the gold token. `0.0` is teacher forcing and
    /// `1.0` never looks at the gold tokens.
    #[serde(default = "default_scheduled_sampling_ratio")]
    pub scheduled_sampling_ratio: f64,
    #[serde(default = "default_use_bleu")]
    pub use_bleu: bool,
    #[serde(default = "default_bleu_ngram_weights")]
    pub bleu_ngram_weights: Vec<f64>,
    #[serde(default = "default_target_decoder_layers")]
    pub target_decoder_layers: usize,
    #[serde(default = "default_loss_weight")]
    pub loss_weight: f64,
    /// Divide the loss by `ln(vocab_size)`.
    #[serde(default = "default_normalize_loss_by_vocab")]
    pub normalize_loss_by_vocab: bool,
    #[serde(default)]
    pub loss_average: LossAverage,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            input_dim: 256,
            dataset_embeds_dim: 0,
            max_decoding_steps: 64,
            beam_size: None,
            per_node_beam_size: None,
            target_embedding_dim: None,
            attention: None,
            scheduled_sampling_ratio: default_scheduled_sampling_ratio(),
            use_bleu: default_use_bleu(),
            bleu_ngram_weights: default_bleu_ngram_weights(),
            target_decoder_layers: default_target_decoder_layers(),
            loss_weight: default_loss_weight(),
            normalize_loss_by_vocab: default_normalize_loss_by_vocab(),
            loss_average: LossAverage::default(),
            special_tokens: SpecialTokens::default(),
        }
    }
}

impl DecoderConfig {
    /// The encoder output dimension, which is also the decoder hidden size since the
    /// decoder hidden state is initialized from the final encoder state.
    pub fn encoder_output_dim(&self) -> usize {
        self.input_dim + self.dataset_embeds_dim
    }

    pub fn decoder_output_dim(&self) -> usize {
        self.encoder_output_dim()
    }

    pub fn target_embedding_dim(&self) -> usize {
        self.target_embedding_dim
            .unwrap_or_else(|| self.decoder_output_dim())
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size.unwrap_or(1)
    }

    /// Checks the preconditions that do not depend on any input tensor.
    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        self.special_tokens.validate(vocab_size)?;
        if self.encoder_output_dim() == 0 {
            candle::bail!("the encoder output dimension must be positive")
        }
        if self.max_decoding_steps == 0 {
            candle::bail!("max_decoding_steps must be positive")
        }
        if self.target_decoder_layers == 0 {
            candle::bail!("target_decoder_layers must be positive")
        }
        if self.target_embedding_dim() == 0 {
            candle::bail!("target_embedding_dim must be positive")
        }
        let beam_size = self.beam_size();
        if beam_size == 0 || beam_size > vocab_size {
            candle::bail!("beam size {beam_size} must be in [1, {vocab_size}]")
        }
        if let Some(per_node) = self.per_node_beam_size {
            if per_node == 0 || per_node > vocab_size {
                candle::bail!("per node beam size {per_node} must be in [1, {vocab_size}]")
            }
        }
        if !(0.0..=1.0).contains(&self.scheduled_sampling_ratio) {
            candle::bail!(
                "scheduled_sampling_ratio must be in [0, 1], got {}",
                self.scheduled_sampling_ratio
            )
        }
        if self.use_bleu && self.bleu_ngram_weights.is_empty() {
            candle::bail!("bleu_ngram_weights cannot be empty")
        }
        Ok(())
    }
}
