//! Recurrent cells advancing the decoder state one timestep at a time.
use candle::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

/// Hidden and cell vectors of a LSTM.
///
/// Both tensors have shape `(batch, hidden)` for a single cell and `(layers, batch, hidden)`
/// for a stacked one.
#[derive(Debug, Clone)]
pub struct CellState {
    h: Tensor,
    c: Tensor,
}

impl CellState {
    pub fn new(h: Tensor, c: Tensor) -> Result<Self> {
        if h.shape() != c.shape() {
            candle::bail!(
                "hidden {:?} and context {:?} must share a shape",
                h.shape(),
                c.shape()
            )
        }
        Ok(Self { h, c })
    }

    /// The hidden state vector, which is also the output of the LSTM.
    pub fn h(&self) -> &Tensor {
        &self.h
    }

    /// The cell state vector.
    pub fn c(&self) -> &Tensor {
        &self.c
    }

    /// Index of the batch (or beam group) dimension.
    pub fn batch_dim(&self) -> usize {
        self.h.rank() - 2
    }

    /// Keeps the batch rows listed in `indexes`, in that order.
    pub fn index_select(&self, indexes: &Tensor) -> Result<Self> {
        let dim = self.batch_dim();
        Ok(Self {
            h: self.h.index_select(indexes, dim)?,
            c: self.c.index_select(indexes, dim)?,
        })
    }
}

/// A recurrent unit that can be advanced one timestep.
pub trait RecurrentCell: std::fmt::Debug {
    /// State whose hidden part is `init_hidden` of shape `(batch, hidden)` and whose cell
    /// part is zero.
    fn initial_state(&self, init_hidden: &Tensor) -> Result<CellState>;

    /// Applies one step, the input has shape `(batch, input_dim)`.
    fn advance(&self, input: &Tensor, state: &CellState) -> Result<CellState>;

    /// The top-layer hidden state, `(batch, hidden)`.
    fn output(&self, state: &CellState) -> Result<Tensor>;

    fn hidden_dim(&self) -> usize;
}

/// A single LSTM layer, the gates are laid out as input, forget, cell, output.
#[derive(Debug, Clone)]
pub struct LstmCell {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden_dim: usize,
    span: tracing::Span,
}

impl LstmCell {
    /// Loads a standalone cell, with the `torch.nn.LSTMCell` parameter names.
    pub fn load(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Self::load_with_suffix(in_dim, hidden_dim, "", vb)
    }

    /// Loads layer `layer_idx` of a multi-layer `torch.nn.LSTM`.
    pub fn load_layer(
        in_dim: usize,
        hidden_dim: usize,
        layer_idx: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::load_with_suffix(in_dim, hidden_dim, &format!("_l{layer_idx}"), vb)
    }

    fn load_with_suffix(
        in_dim: usize,
        hidden_dim: usize,
        suffix: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = 1. / (hidden_dim as f64).sqrt();
        let init = candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let w_ih = vb.get_with_hints(
            (4 * hidden_dim, in_dim),
            &format!("weight_ih{suffix}"),
            init,
        )?;
        let w_hh = vb.get_with_hints(
            (4 * hidden_dim, hidden_dim),
            &format!("weight_hh{suffix}"),
            init,
        )?;
        let b_ih = vb.get_with_hints(4 * hidden_dim, &format!("bias_ih{suffix}"), init)?;
        let b_hh = vb.get_with_hints(4 * hidden_dim, &format!("bias_hh{suffix}"), init)?;
        let span = tracing::span!(tracing::Level::TRACE, "lstm-cell");
        // The recurrence always runs in f32, whatever the dtype of the var builder.
        Ok(Self {
            w_ih: w_ih.to_dtype(DType::F32)?,
            w_hh: w_hh.to_dtype(DType::F32)?,
            b_ih: b_ih.to_dtype(DType::F32)?,
            b_hh: b_hh.to_dtype(DType::F32)?,
            hidden_dim,
            span,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let x = x.to_dtype(DType::F32)?;
        let h = h.to_dtype(DType::F32)?;
        let c = c.to_dtype(DType::F32)?;
        let gates = x.matmul(&self.w_ih.t()?)?.broadcast_add(&self.b_ih)?;
        let gates = gates
            .broadcast_add(&h.matmul(&self.w_hh.t()?)?)?
            .broadcast_add(&self.b_hh)?;
        let chunks = gates.chunk(4, D::Minus1)?;
        let i = candle_nn::ops::sigmoid(&chunks[0])?;
        let f = candle_nn::ops::sigmoid(&chunks[1])?;
        let g = chunks[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&chunks[3])?;
        let c_next = ((&f * &c)? + (&i * &g)?)?;
        let h_next = (&o * c_next.tanh()?)?;
        Ok((h_next, c_next))
    }
}

impl RecurrentCell for LstmCell {
    fn initial_state(&self, init_hidden: &Tensor) -> Result<CellState> {
        let h = init_hidden.to_dtype(DType::F32)?;
        let c = h.zeros_like()?;
        CellState::new(h, c)
    }

    fn advance(&self, input: &Tensor, state: &CellState) -> Result<CellState> {
        let (h, c) = self.step(input, state.h(), state.c())?;
        CellState::new(h, c)
    }

    fn output(&self, state: &CellState) -> Result<Tensor> {
        Ok(state.h().clone())
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

/// `num_layers` LSTM cells applied in sequence at each timestep, the hidden output of a
/// layer being the input of the next one.
#[derive(Debug, Clone)]
pub struct StackedLstm {
    layers: Vec<LstmCell>,
    hidden_dim: usize,
}

impl StackedLstm {
    pub fn load(
        in_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers < 2 {
            candle::bail!("a stacked lstm needs at least two layers, got {num_layers}")
        }
        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let in_dim = if layer_idx == 0 { in_dim } else { hidden_dim };
            layers.push(LstmCell::load_layer(
                in_dim,
                hidden_dim,
                layer_idx,
                vb.clone(),
            )?);
        }
        Ok(Self { layers, hidden_dim })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl RecurrentCell for StackedLstm {
    fn initial_state(&self, init_hidden: &Tensor) -> Result<CellState> {
        let h = init_hidden
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .repeat((self.layers.len(), 1, 1))?;
        let c = h.zeros_like()?;
        CellState::new(h, c)
    }

    fn advance(&self, input: &Tensor, state: &CellState) -> Result<CellState> {
        let (num_layers, _, _) = state.h().dims3()?;
        if num_layers != self.layers.len() {
            candle::bail!(
                "state has {num_layers} layers, the lstm has {}",
                self.layers.len()
            )
        }
        let mut h_layers = Vec::with_capacity(num_layers);
        let mut c_layers = Vec::with_capacity(num_layers);
        let mut xs = input.clone();
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let h = state.h().get(layer_idx)?;
            let c = state.c().get(layer_idx)?;
            let (h, c) = layer.step(&xs, &h, &c)?;
            xs = h.clone();
            h_layers.push(h);
            c_layers.push(c);
        }
        CellState::new(Tensor::stack(&h_layers, 0)?, Tensor::stack(&c_layers, 0)?)
    }

    fn output(&self, state: &CellState) -> Result<Tensor> {
        state.h().get(self.layers.len() - 1)
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

/// A single cell for one layer, a stacked lstm otherwise.
///
/// Parameter names follow `torch.nn.LSTMCell` for a single layer and `torch.nn.LSTM`
/// (`weight_ih_l{k}`, ...) for a stack.
pub fn recurrent_cell(
    in_dim: usize,
    hidden_dim: usize,
    num_layers: usize,
    vb: VarBuilder,
) -> Result<Box<dyn RecurrentCell>> {
    let cell: Box<dyn RecurrentCell> = match num_layers {
        0 => candle::bail!("the recurrent cell needs at least one layer"),
        1 => Box::new(LstmCell::load(in_dim, hidden_dim, vb)?),
        n => Box::new(StackedLstm::load(in_dim, hidden_dim, n, vb)?),
    };
    Ok(cell)
}
