use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::{DType, MatmulLayout};

#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("{op} has no kernel for dtype {dtype}.")]
    UnsupportedDType { op: &'static str, dtype: DType },
    #[error("Unknown foreach op code {0}.")]
    UnknownOpCode(u8),
    #[error("{op} does not support this combination: {reason}.")]
    UnsupportedCombination { op: &'static str, reason: String },
}

/// Foreach kernels are compiled once per element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[repr(u64)]
pub enum ForeachKey {
    F16 = 1,
    F32 = 2,
    I32 = 3,
    BF16 = 4,
    I8 = 7,
    I64 = 10,
    F64 = 11,
    Bool = 12,
}

impl ForeachKey {
    pub fn code(&self) -> u64 {
        *self as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum RmsNormTemplate {
    Normal,
    SplitD,
    MergeN,
    SingleRow,
}

impl RmsNormTemplate {
    pub fn code(&self) -> u64 {
        match self {
            RmsNormTemplate::Normal => 0,
            RmsNormTemplate::SplitD => 1,
            RmsNormTemplate::MergeN => 2,
            RmsNormTemplate::SingleRow => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradKey {
    F32,
    F16,
    BF16,
}

impl GradKey {
    pub fn code(&self) -> u64 {
        match self {
            GradKey::F32 => 4,
            GradKey::F16 => 2,
            GradKey::BF16 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    I32,
    I64,
}

impl IndexKey {
    pub fn code(&self) -> u64 {
        match self {
            IndexKey::I32 => 400,
            IndexKey::I64 => 800,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            IndexKey::I32 => 4,
            IndexKey::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingGradKey {
    /// All indices stay resident, no sorting pass.
    FullLoad { grad: GradKey, scale_by_freq: bool },
    Sorted { index: IndexKey, grad: GradKey },
}

impl EmbeddingGradKey {
    pub fn code(&self) -> u64 {
        match self {
            EmbeddingGradKey::FullLoad {
                grad,
                scale_by_freq,
            } => 100 + grad.code() + if *scale_by_freq { 10 } else { 0 },
            EmbeddingGradKey::Sorted { index, grad } => index.code() + grad.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum GeluTemplate {
    PerTensor,
    Function,
    Performance,
    DynamicWorkspace,
    DynamicNormal,
}

impl GeluTemplate {
    pub fn code(&self) -> u64 {
        match self {
            GeluTemplate::PerTensor => 0,
            GeluTemplate::Function => 1,
            GeluTemplate::Performance => 2,
            GeluTemplate::DynamicWorkspace => 3,
            GeluTemplate::DynamicNormal => 4,
        }
    }
}

/// Input and scale element types as one kernel instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum GeluDTypes {
    BF16BF16,
    HalfHalf,
    HalfFloat,
    FloatFloat,
    BF16Float,
}

impl GeluDTypes {
    pub fn code(&self) -> u64 {
        match self {
            GeluDTypes::BF16BF16 => 0,
            GeluDTypes::HalfHalf => 1,
            GeluDTypes::HalfFloat => 2,
            GeluDTypes::FloatFloat => 3,
            GeluDTypes::BF16Float => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeluQuantKey {
    pub template: GeluTemplate,
    pub dtypes: GeluDTypes,
}

impl GeluQuantKey {
    pub fn code(&self) -> u64 {
        1000 + 10 * self.template.code() + self.dtypes.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum PoolTemplate {
    SplitC,
    SplitW,
    MultiW,
    ReduceD,
    Normal,
}

impl PoolTemplate {
    pub fn code(&self) -> u64 {
        match self {
            PoolTemplate::SplitC => 1,
            PoolTemplate::SplitW => 2,
            PoolTemplate::MultiW => 3,
            PoolTemplate::ReduceD => 4,
            PoolTemplate::Normal => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum PoolDType {
    F32,
    F16,
    BF16,
}

impl PoolDType {
    pub fn code(&self) -> u64 {
        match self {
            PoolDType::F32 => 0,
            PoolDType::F16 => 1,
            PoolDType::BF16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvgPool3dKey {
    pub template: PoolTemplate,
    pub dtype: PoolDType,
}

impl AvgPool3dKey {
    pub fn code(&self) -> u64 {
        10 * self.template.code() + self.dtype.code()
    }
}

/// Matmul kernels are compiled per dtype; the key only selects the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatmulKey {
    pub batch_split: bool,
    pub layout: MatmulLayout,
    pub transpose_x2: bool,
}

impl MatmulKey {
    pub fn code(&self) -> u64 {
        let layout = match self.layout {
            MatmulLayout::BatchFirst => 0,
            MatmulLayout::RowsFirst => 2,
        };
        100 * self.batch_split as u64 + 10 * layout + self.transpose_x2 as u64
    }
}

/// # VariantKey
///
/// Closed set of kernel code paths. `code()` is what the launcher dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKey {
    Foreach(ForeachKey),
    RmsNorm(RmsNormTemplate),
    EmbeddingDenseGrad(EmbeddingGradKey),
    GeluQuant(GeluQuantKey),
    AvgPool3d(AvgPool3dKey),
    TransposeBatchMatmul(MatmulKey),
}

impl VariantKey {
    pub fn code(&self) -> u64 {
        match self {
            VariantKey::Foreach(k) => k.code(),
            VariantKey::RmsNorm(t) => t.code(),
            VariantKey::EmbeddingDenseGrad(k) => k.code(),
            VariantKey::GeluQuant(k) => k.code(),
            VariantKey::AvgPool3d(k) => k.code(),
            VariantKey::TransposeBatchMatmul(k) => k.code(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            VariantKey::Foreach(k) => format!("foreach_{k}"),
            VariantKey::RmsNorm(t) => format!("rms_norm_{t}"),
            VariantKey::EmbeddingDenseGrad(EmbeddingGradKey::FullLoad { .. }) => {
                "embedding_grad_full_load".to_string()
            }
            VariantKey::EmbeddingDenseGrad(EmbeddingGradKey::Sorted { .. }) => {
                "embedding_grad_sorted".to_string()
            }
            VariantKey::GeluQuant(k) => format!("gelu_quant_{}_{}", k.template, k.dtypes),
            VariantKey::AvgPool3d(k) => format!("avg_pool3d_{}_{}", k.template, k.dtype),
            VariantKey::TransposeBatchMatmul(k) => format!(
                "transpose_batch_matmul_{}{}",
                k.layout,
                if k.batch_split { "_batch_split" } else { "" }
            ),
        }
    }
}

/// Which element types an operator family has kernels for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeSupport {
    Float,
    Arithmetic,
    Copy,
    Sign,
}

impl DTypeSupport {
    pub fn contains(&self, dtype: DType) -> bool {
        use DType::*;
        match self {
            DTypeSupport::Float => matches!(dtype, F16 | F32 | BF16),
            DTypeSupport::Arithmetic => matches!(dtype, F16 | F32 | BF16 | I32),
            DTypeSupport::Copy => matches!(dtype, F16 | F32 | BF16 | I32 | I8 | I64 | F64 | Bool),
            DTypeSupport::Sign => matches!(dtype, F16 | F32 | BF16 | I32 | I8 | I64),
        }
    }
}

/// # VariantSelector
///
/// Maps resolved dtypes onto keys. Each mapping is a single total match; anything outside the
/// table is an error, never a fallback.
pub struct VariantSelector;

impl VariantSelector {
    pub fn foreach(
        op: &'static str,
        support: DTypeSupport,
        dtype: DType,
    ) -> Result<ForeachKey, VariantError> {
        let unsupported = VariantError::UnsupportedDType { op, dtype };
        if !support.contains(dtype) {
            return Err(unsupported);
        }
        match dtype {
            DType::F16 => Ok(ForeachKey::F16),
            DType::F32 => Ok(ForeachKey::F32),
            DType::I32 => Ok(ForeachKey::I32),
            DType::BF16 => Ok(ForeachKey::BF16),
            DType::I8 => Ok(ForeachKey::I8),
            DType::I64 => Ok(ForeachKey::I64),
            DType::F64 => Ok(ForeachKey::F64),
            DType::Bool => Ok(ForeachKey::Bool),
            DType::U8 | DType::F8E5M2 | DType::F8E4M3 | DType::HiF8 => Err(unsupported),
        }
    }

    pub fn grad(op: &'static str, dtype: DType) -> Result<GradKey, VariantError> {
        match dtype {
            DType::F32 => Ok(GradKey::F32),
            DType::F16 => Ok(GradKey::F16),
            DType::BF16 => Ok(GradKey::BF16),
            _ => Err(VariantError::UnsupportedDType { op, dtype }),
        }
    }

    pub fn index(op: &'static str, dtype: DType) -> Result<IndexKey, VariantError> {
        match dtype {
            DType::I32 => Ok(IndexKey::I32),
            DType::I64 => Ok(IndexKey::I64),
            _ => Err(VariantError::UnsupportedDType { op, dtype }),
        }
    }

    pub fn pool(op: &'static str, dtype: DType) -> Result<PoolDType, VariantError> {
        match dtype {
            DType::F32 => Ok(PoolDType::F32),
            DType::F16 => Ok(PoolDType::F16),
            DType::BF16 => Ok(PoolDType::BF16),
            _ => Err(VariantError::UnsupportedDType { op, dtype }),
        }
    }

    /// `(x, y, bias)` rows with a kernel. `x2` must match `x1`; a missing bias matches any row.
    pub fn matmul(
        op: &'static str,
        x: DType,
        y: DType,
        bias: Option<DType>,
    ) -> Result<(), VariantError> {
        use DType::*;
        let supported = match (x, y, bias) {
            (F16, F16, None | Some(F16) | Some(F32)) => true,
            (F16, I8, None | Some(F32)) => true,
            (F32, F32, None | Some(F32)) => true,
            (BF16, BF16, None | Some(F32)) => true,
            (F16 | F32 | BF16, _, _) => false,
            (x, _, _) => return Err(VariantError::UnsupportedDType { op, dtype: x }),
        };
        if !supported {
            let bias = bias.map_or("none".to_string(), |b| b.to_string());
            return Err(VariantError::UnsupportedCombination {
                op,
                reason: format!("input {x} with output {y} and bias {bias}"),
            });
        }
        Ok(())
    }

    /// The scale dtype wins when it is a half type, otherwise the input decides.
    pub fn gelu_dtypes(
        op: &'static str,
        x: DType,
        scale: Option<DType>,
    ) -> Result<GeluDTypes, VariantError> {
        match (x, scale) {
            (DType::F16, Some(DType::F16)) => Ok(GeluDTypes::HalfHalf),
            (DType::BF16, Some(DType::BF16)) => Ok(GeluDTypes::BF16BF16),
            (DType::F32, None | Some(DType::F32)) => Ok(GeluDTypes::FloatFloat),
            (DType::F16, None | Some(DType::F32)) => Ok(GeluDTypes::HalfFloat),
            (DType::BF16, None | Some(DType::F32)) => Ok(GeluDTypes::BF16Float),
            (x, Some(scale)) if matches!(x, DType::F16 | DType::BF16 | DType::F32) => {
                Err(VariantError::UnsupportedCombination {
                    op,
                    reason: format!("input {x} with scale {scale}"),
                })
            }
            (x, _) => Err(VariantError::UnsupportedDType { op, dtype: x }),
        }
    }
}
