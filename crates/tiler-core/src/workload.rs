use derive_new::new;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{DType, ForeachOp, RVec, Shape, TilingDType};

#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct Operand {
    pub shape: Shape,
    pub dtype: DType,
}

impl Operand {
    pub fn typed<T: TilingDType>(shape: Shape) -> Self {
        Self::new(shape, T::dt())
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn width(&self) -> usize {
        self.dtype.size_of()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsNormMode {
    /// Gemma flavour: `x * (1 + gamma)`, with its own column factors.
    pub gemma: bool,
    pub epsilon: f32,
}

impl Default for RmsNormMode {
    fn default() -> Self {
        Self {
            gemma: false,
            epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct EmbeddingGradMode {
    pub num_weights: usize,
    pub padding_idx: i64,
    pub scale_grad_by_freq: bool,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Approximate {
    #[default]
    None,
    Tanh,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum QuantMode {
    #[default]
    Static,
    Dynamic,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum RoundMode {
    #[default]
    Rint,
    Round,
    Hybrid,
}

/// Operands are `[x, scale?, offset?]`; the flags say which optional operands are present.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct GeluQuantMode {
    pub approximate: Approximate,
    pub quant: QuantMode,
    pub dst: DType,
    pub round: RoundMode,
    pub scale: bool,
    pub offset: bool,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PoolFormat {
    #[default]
    Ndhwc,
    Ncdhw,
}

/// Window geometry per spatial axis, ordered `[d, h, w]`.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct AvgPool3dMode {
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub pad: [usize; 3],
    pub ceil_mode: bool,
    pub count_include_pad: bool,
    /// Zero divides by the window size.
    pub divisor_override: i64,
    pub format: PoolFormat,
}

/// Where the batch axis sits in the stored `x1`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum MatmulLayout {
    /// `[B, M, K]`
    #[default]
    BatchFirst,
    /// `[M, B, K]`, read through a `[1, 0, 2]` permutation.
    RowsFirst,
}

/// Operands are `[x1, x2, bias?, scale?]`.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct MatmulMode {
    pub layout: MatmulLayout,
    /// `x2` is stored `[B, N, K]`.
    pub transpose_x2: bool,
    pub out: DType,
    pub bias: bool,
    /// Per-channel int8 requantization of the output.
    pub scale: bool,
    pub batch_split_factor: usize,
}

/// # OperatorKind
///
/// Operator identity together with the mode flags that steer its tiling.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    Foreach(ForeachOp),
    RmsNorm(RmsNormMode),
    EmbeddingDenseGrad(EmbeddingGradMode),
    GeluQuant(GeluQuantMode),
    AvgPool3d(AvgPool3dMode),
    TransposeBatchMatmul(MatmulMode),
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Foreach(op) => op.into(),
            OperatorKind::RmsNorm(RmsNormMode { gemma: true, .. }) => "gemma_rms_norm",
            OperatorKind::RmsNorm(_) => "rms_norm",
            OperatorKind::EmbeddingDenseGrad(_) => "embedding_dense_grad",
            OperatorKind::GeluQuant(_) => "gelu_quant",
            OperatorKind::AvgPool3d(_) => "avg_pool3d",
            OperatorKind::TransposeBatchMatmul(_) => "transpose_batch_matmul",
        }
    }
}

/// # WorkloadDescriptor
///
/// Already validated operand shapes and dtypes plus the operator's mode flags.
/// Carries only what partitioning needs; broadcasting and shape agreement are the caller's concern.
#[derive(Debug, Clone, new, PartialEq)]
pub struct WorkloadDescriptor {
    pub operands: RVec<Operand>,
    pub op: OperatorKind,
}

impl WorkloadDescriptor {
    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    pub fn total_elements(&self) -> usize {
        self.operands.iter().map(Operand::numel).sum()
    }
}
