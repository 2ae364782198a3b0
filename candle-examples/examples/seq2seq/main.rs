//! Trains a LSTM encoder-decoder to reverse sequences of digits, then decodes a fresh batch
//! with beam search.
use std::sync::Arc;

use anyhow::Result;
use candle::{DType, Device, Module, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap, RNN};
use candle_seq2seq::{
    AttentionConfig, DecoderConfig, Seq2SeqDecoder, SpecialTokens, TargetTokens,
    TargetVocabulary, Vocabulary,
};
use clap::{Parser, ValueEnum};
use rand::{rngs::StdRng, Rng, SeedableRng};

const DIGITS: u32 = 10;
// Digits come after the padding, unknown, start and end tokens.
const FIRST_DIGIT: u32 = 4;

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum WhichAttention {
    None,
    DotProduct,
    Bilinear,
    Additive,
    Cosine,
}

impl WhichAttention {
    fn config(&self) -> Option<AttentionConfig> {
        match self {
            Self::None => None,
            Self::DotProduct => Some(AttentionConfig::DotProduct),
            Self::Bilinear => Some(AttentionConfig::Bilinear { activation: None }),
            Self::Additive => Some(AttentionConfig::Additive),
            Self::Cosine => Some(AttentionConfig::Cosine),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// The seed used for the data, the initialization and scheduled sampling.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// A json file holding the decoder configuration, overrides the flags below.
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Length of the digit sequences to reverse.
    #[arg(long, default_value_t = 5)]
    seq_len: usize,

    #[arg(long, default_value_t = 64)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 1)]
    layers: usize,

    #[arg(long, default_value_t = 3)]
    beam_size: usize,

    #[arg(long, default_value_t = 10)]
    max_decoding_steps: usize,

    #[arg(long, value_enum, default_value_t = WhichAttention::DotProduct)]
    attention: WhichAttention,

    /// Probability of feeding the decoder its own predictions during training.
    #[arg(long, default_value_t = 0.)]
    scheduled_sampling_ratio: f64,

    #[arg(long, default_value_t = 400)]
    epochs: usize,

    #[arg(long, default_value_t = 0.01)]
    learning_rate: f64,
}

impl Args {
    fn decoder_config(&self) -> Result<DecoderConfig> {
        let config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => DecoderConfig {
                task: "reverse".to_string(),
                input_dim: self.hidden_dim,
                max_decoding_steps: self.max_decoding_steps,
                beam_size: Some(self.beam_size),
                attention: self.attention.config(),
                scheduled_sampling_ratio: self.scheduled_sampling_ratio,
                target_decoder_layers: self.layers,
                ..Default::default()
            },
        };
        Ok(config)
    }
}

fn vocabulary() -> Result<TargetVocabulary> {
    let specials = ["@@PADDING@@", "@@UNKNOWN@@", "@start@", "@end@"].map(String::from);
    let digits = (0..DIGITS).map(|d| d.to_string());
    Ok(TargetVocabulary::new(specials.into_iter().chain(digits))?)
}

struct Encoder {
    embedding: candle_nn::Embedding,
    lstm: candle_nn::LSTM,
}

impl Encoder {
    fn new(vocab_size: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, hidden_dim, vb.pp("embedding"))?;
        let lstm = candle_nn::lstm(hidden_dim, hidden_dim, Default::default(), vb.pp("lstm"))?;
        Ok(Self { embedding, lstm })
    }

    fn forward(&self, source: &Tensor) -> Result<Tensor> {
        let embedded = self.embedding.forward(source)?;
        let states = self.lstm.seq(&embedded)?;
        Ok(self.lstm.states_to_tensor(&states)?)
    }
}

struct Batch {
    source: Tensor,
    source_mask: Tensor,
    targets: TargetTokens,
}

fn reversal_batch(
    rng: &mut StdRng,
    batch_size: usize,
    seq_len: usize,
    tokens: &SpecialTokens,
    device: &Device,
) -> Result<Batch> {
    let mut source = Vec::with_capacity(batch_size * seq_len);
    let mut target = Vec::with_capacity(batch_size * (seq_len + 2));
    for _ in 0..batch_size {
        let digits: Vec<u32> = (0..seq_len)
            .map(|_| FIRST_DIGIT + rng.gen_range(0..DIGITS))
            .collect();
        target.push(tokens.start_index);
        target.extend(digits.iter().rev());
        target.push(tokens.end_index);
        source.extend(digits);
    }
    let source = Tensor::from_vec(source, (batch_size, seq_len), device)?;
    let source_mask = Tensor::ones((batch_size, seq_len), DType::U8, device)?;
    let target = Tensor::from_vec(target, (batch_size, seq_len + 2), device)?;
    let targets = TargetTokens::from_ids(target, tokens.pad_index)?;
    Ok(Batch {
        source,
        source_mask,
        targets,
    })
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = candle_examples::device(args.cpu)?;
    let config = args.decoder_config()?;
    if args.seq_len + 1 > config.max_decoding_steps {
        anyhow::bail!(
            "sequences of length {} need at least {} decoding steps",
            args.seq_len,
            args.seq_len + 1
        )
    }
    let tokens = config.special_tokens;
    let vocab: Arc<dyn Vocabulary> = Arc::new(vocabulary()?);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let encoder = Encoder::new(vocab.size(), config.encoder_output_dim(), vb.pp("encoder"))?;
    let mut decoder = Seq2SeqDecoder::new(config, vocab.clone(), vb.pp("decoder"))?;
    let params = ParamsAdamW {
        lr: args.learning_rate,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

    let start = std::time::Instant::now();
    for epoch in 1..=args.epochs {
        let batch = reversal_batch(&mut rng, args.batch_size, args.seq_len, &tokens, &device)?;
        let encoder_outputs = encoder.forward(&batch.source)?;
        let output = decoder.forward_t(
            &encoder_outputs,
            &batch.source_mask,
            Some(&batch.targets),
            true,
            &mut rng,
        )?;
        let loss = match output.loss {
            Some(loss) => loss,
            None => anyhow::bail!("no loss returned in training mode"),
        };
        optimizer.backward_step(&loss)?;
        if epoch % 50 == 0 {
            println!("{epoch:4} train loss: {:8.5}", loss.to_scalar::<f32>()?);
        }
    }
    println!("trained in {:?}", start.elapsed());

    let batch = reversal_batch(&mut rng, args.batch_size, args.seq_len, &tokens, &device)?;
    let encoder_outputs = encoder.forward(&batch.source)?;
    let output = decoder.forward_t(
        &encoder_outputs,
        &batch.source_mask,
        Some(&batch.targets),
        false,
        &mut rng,
    )?;
    if let Some(loss) = &output.loss {
        println!("validation loss: {:8.5}", loss.to_scalar::<f32>()?);
    }
    for (name, value) in decoder.metrics(true) {
        println!("{name}: {value:.4}");
    }
    let predictions = match &output.predictions {
        Some(predictions) => predictions,
        None => anyhow::bail!("no predictions returned by beam search"),
    };
    let readable = decoder.make_output_human_readable(predictions)?;
    let sources = batch.source.to_vec2::<u32>()?;
    for (source, hypotheses) in sources.iter().zip(readable.iter()).take(5) {
        let source: Vec<&str> = source.iter().filter_map(|&id| vocab.token(id)).collect();
        let best = hypotheses.first().map(|h| h.join(" ")).unwrap_or_default();
        println!("{} -> {best}", source.join(" "));
    }
    Ok(())
}
