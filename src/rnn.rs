//! GRU and LSTM cells and their multi-layer, bidirectional stacking.
//!
//! Sequences are right-padded; each batch element is only advanced over its
//! true length, which gives the same outputs and final states as running the
//! recurrence on a packed sequence.

use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;

use crate::config::CellKind;
use crate::error::{Result, Seq2SeqError};
use crate::layers::{sigmoid, Dropout, Linear};

/// Per-cell state for one timestep: `(batch, hidden)`
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    pub h: Array2<f32>,
    /// Cell memory, LSTM only
    pub c: Option<Array2<f32>>,
}

impl CellState {
    /// Copies rows of `next` where `active` is set, leaving the others untouched.
    fn update_rows(&mut self, next: &CellState, active: &[bool]) {
        for b in (0..active.len()).filter(|&b| active[b]) {
            self.h.row_mut(b).assign(&next.h.row(b));
            if let (Some(c), Some(next_c)) = (self.c.as_mut(), next.c.as_ref()) {
                c.row_mut(b).assign(&next_c.row(b));
            }
        }
    }
}

/// Stacked state `(layers * directions, batch, hidden / directions)`
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub h: Array3<f32>,
    pub c: Option<Array3<f32>>,
}

impl RecurrentState {
    pub fn zeros(kind: CellKind, num_cells: usize, batch_size: usize, hidden_size: usize) -> Self {
        let shape = (num_cells, batch_size, hidden_size);
        Self {
            h: Array3::zeros(shape),
            c: match kind {
                CellKind::Gru => None,
                CellKind::Lstm => Some(Array3::zeros(shape)),
            },
        }
    }

    pub fn batch_size(&self) -> usize {
        self.h.len_of(Axis(1))
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.h.dim()
    }

    fn cell(&self, idx: usize) -> CellState {
        CellState {
            h: self.h.index_axis(Axis(0), idx).to_owned(),
            c: self.c.as_ref().map(|c| c.index_axis(Axis(0), idx).to_owned()),
        }
    }

    fn set_cell(&mut self, idx: usize, state: &CellState) {
        self.h.index_axis_mut(Axis(0), idx).assign(&state.h);
        if let (Some(c), Some(cell_c)) = (self.c.as_mut(), state.c.as_ref()) {
            c.index_axis_mut(Axis(0), idx).assign(cell_c);
        }
    }
}

// GRU cell
#[derive(Debug, Clone)]
pub struct GruCell {
    hidden_size: usize,
    // update gate
    w_iz: Linear,
    w_hz: Linear,
    // reset gate
    w_ir: Linear,
    w_hr: Linear,
    // candidate
    w_in: Linear,
    w_hn: Linear,
}

impl GruCell {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        Self {
            hidden_size,
            w_iz: Linear::new(input_size, hidden_size, rng),
            w_hz: Linear::new(hidden_size, hidden_size, rng),
            w_ir: Linear::new(input_size, hidden_size, rng),
            w_hr: Linear::new(hidden_size, hidden_size, rng),
            w_in: Linear::new(input_size, hidden_size, rng),
            w_hn: Linear::new(hidden_size, hidden_size, rng),
        }
    }

    /// z = σ(x Wiz + h Whz), r = σ(x Wir + h Whr),
    /// n = tanh(x Win + r ⊙ (h Whn)), h' = (1 - z) ⊙ n + z ⊙ h
    pub fn forward(&self, x: &Array2<f32>, h_prev: &Array2<f32>) -> Array2<f32> {
        let z = (self.w_iz.forward(x) + self.w_hz.forward(h_prev)).mapv(sigmoid);
        let r = (self.w_ir.forward(x) + self.w_hr.forward(h_prev)).mapv(sigmoid);
        let n = (self.w_in.forward(x) + &r * &self.w_hn.forward(h_prev)).mapv(f32::tanh);
        let one_minus_z = z.mapv(|v| 1.0 - v);
        &one_minus_z * &n + &z * h_prev
    }

    fn num_parameters(&self) -> usize {
        [&self.w_iz, &self.w_hz, &self.w_ir, &self.w_hr, &self.w_in, &self.w_hn]
            .iter()
            .map(|l| l.num_parameters())
            .sum()
    }
}

// LSTM cell
#[derive(Debug, Clone)]
pub struct LstmCell {
    hidden_size: usize,
    w_ii: Linear,
    w_hi: Linear,
    w_if: Linear,
    w_hf: Linear,
    w_ig: Linear,
    w_hg: Linear,
    w_io: Linear,
    w_ho: Linear,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        Self {
            hidden_size,
            w_ii: Linear::new(input_size, hidden_size, rng),
            w_hi: Linear::new(hidden_size, hidden_size, rng),
            w_if: Linear::new(input_size, hidden_size, rng),
            w_hf: Linear::new(hidden_size, hidden_size, rng),
            w_ig: Linear::new(input_size, hidden_size, rng),
            w_hg: Linear::new(hidden_size, hidden_size, rng),
            w_io: Linear::new(input_size, hidden_size, rng),
            w_ho: Linear::new(hidden_size, hidden_size, rng),
        }
    }

    /// Returns `(h', c')`
    pub fn forward(
        &self,
        x: &Array2<f32>,
        h_prev: &Array2<f32>,
        c_prev: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let i = (self.w_ii.forward(x) + self.w_hi.forward(h_prev)).mapv(sigmoid);
        let f = (self.w_if.forward(x) + self.w_hf.forward(h_prev)).mapv(sigmoid);
        let g = (self.w_ig.forward(x) + self.w_hg.forward(h_prev)).mapv(f32::tanh);
        let o = (self.w_io.forward(x) + self.w_ho.forward(h_prev)).mapv(sigmoid);
        let c = &f * c_prev + &i * &g;
        let h = &o * &c.mapv(f32::tanh);
        (h, c)
    }

    fn num_parameters(&self) -> usize {
        [
            &self.w_ii, &self.w_hi, &self.w_if, &self.w_hf, &self.w_ig, &self.w_hg, &self.w_io,
            &self.w_ho,
        ]
        .iter()
        .map(|l| l.num_parameters())
        .sum()
    }
}

#[derive(Debug, Clone)]
pub enum Cell {
    Gru(GruCell),
    Lstm(LstmCell),
}

impl Cell {
    pub fn new(kind: CellKind, input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        match kind {
            CellKind::Gru => Cell::Gru(GruCell::new(input_size, hidden_size, rng)),
            CellKind::Lstm => Cell::Lstm(LstmCell::new(input_size, hidden_size, rng)),
        }
    }

    pub fn hidden_size(&self) -> usize {
        match self {
            Cell::Gru(cell) => cell.hidden_size,
            Cell::Lstm(cell) => cell.hidden_size,
        }
    }

    pub fn step(&self, x: &Array2<f32>, state: &CellState) -> Result<CellState> {
        match self {
            Cell::Gru(cell) => Ok(CellState {
                h: cell.forward(x, &state.h),
                c: None,
            }),
            Cell::Lstm(cell) => {
                let c_prev = state
                    .c
                    .as_ref()
                    .ok_or(Seq2SeqError::StateNotInitialized("lstm cell"))?;
                let (h, c) = cell.forward(x, &state.h, c_prev);
                Ok(CellState { h, c: Some(c) })
            }
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            Cell::Gru(cell) => cell.num_parameters(),
            Cell::Lstm(cell) => cell.num_parameters(),
        }
    }
}

/// Multi-layer, optionally bidirectional recurrent network.
///
/// Cells are indexed `layer * num_directions + direction`; each layer after
/// the first consumes the concatenated outputs of both directions below it.
#[derive(Debug, Clone)]
pub struct StackedRnn {
    kind: CellKind,
    cells: Vec<Cell>,
    num_layers: usize,
    num_directions: usize,
    hidden_size: usize,
    dropout: Dropout,
}

impl StackedRnn {
    pub fn new(
        kind: CellKind,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let num_directions = if bidirectional { 2 } else { 1 };
        let mut cells = Vec::with_capacity(num_layers * num_directions);
        for layer in 0..num_layers {
            let layer_input = if layer == 0 {
                input_size
            } else {
                hidden_size * num_directions
            };
            for _ in 0..num_directions {
                cells.push(Cell::new(kind, layer_input, hidden_size, rng));
            }
        }
        Self {
            kind,
            cells,
            num_layers,
            num_directions,
            hidden_size,
            dropout: Dropout::new(dropout),
        }
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Width of each output position: `hidden_size * num_directions`
    pub fn output_size(&self) -> usize {
        self.hidden_size * self.num_directions
    }

    pub fn num_parameters(&self) -> usize {
        self.cells.iter().map(Cell::num_parameters).sum()
    }

    pub fn init_state(&self, batch_size: usize) -> RecurrentState {
        RecurrentState::zeros(self.kind, self.cells.len(), batch_size, self.hidden_size)
    }

    /// Runs the stack over `(batch, len, input)` from `init`.
    ///
    /// Returns the outputs `(batch, len, hidden * directions)`, zero at every
    /// position `>= lengths[b]`, and the state each element reached at the end
    /// of its own sequence. Dropout between layers is applied only when an rng
    /// is supplied.
    pub fn forward(
        &self,
        input: &Array3<f32>,
        lengths: &[usize],
        init: &RecurrentState,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array3<f32>, RecurrentState)> {
        let (batch, max_len, _) = input.dim();
        if lengths.len() != batch {
            return Err(Seq2SeqError::shape("sequence lengths", batch, lengths.len()));
        }
        let expected = (self.cells.len(), batch, self.hidden_size);
        if init.shape() != expected {
            return Err(Seq2SeqError::shape("recurrent state", expected, init.shape()));
        }

        let mut final_state = init.clone();
        let mut layer_input = input.to_owned();

        for layer in 0..self.num_layers {
            let mut layer_output = Array3::zeros((batch, max_len, self.output_size()));
            for dir in 0..self.num_directions {
                let idx = layer * self.num_directions + dir;
                let cell = &self.cells[idx];
                let offset = dir * self.hidden_size;
                let order: Vec<usize> = if dir == 0 {
                    (0..max_len).collect()
                } else {
                    (0..max_len).rev().collect()
                };

                let mut state = init.cell(idx);
                for t in order {
                    let active: Vec<bool> = lengths.iter().map(|&len| t < len).collect();
                    if !active.iter().any(|&on| on) {
                        continue;
                    }
                    let x_t = layer_input.index_axis(Axis(1), t).to_owned();
                    let next = cell.step(&x_t, &state)?;
                    state.update_rows(&next, &active);
                    for b in (0..active.len()).filter(|&b| active[b]) {
                        layer_output
                            .slice_mut(s![b, t, offset..offset + self.hidden_size])
                            .assign(&state.h.row(b));
                    }
                }
                final_state.set_cell(idx, &state);
            }

            let is_last = layer + 1 == self.num_layers;
            layer_input = match dropout_rng.as_deref_mut() {
                Some(rng) if !is_last => self.dropout.apply(&layer_output, rng),
                _ => layer_output,
            };
        }

        Ok((layer_input, final_state))
    }
}
