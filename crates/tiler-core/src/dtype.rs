use half::{bf16, f16};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Default, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum DType {
    F16,
    BF16,
    #[default]
    F32,
    F64,
    I8,
    U8,
    I32,
    I64,
    Bool,
    F8E5M2,
    F8E4M3,
    HiF8,
}

impl DType {
    /// Returns the size of the type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::F8E5M2 | DType::F8E4M3 | DType::HiF8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn class(self) -> DTypeClass {
        match self.size_of() {
            1 => DTypeClass::Narrow8,
            2 => DTypeClass::Half16,
            4 => DTypeClass::Native32,
            _ => DTypeClass::Wide64,
        }
    }

    /// Number of elements in one alignment block, never less than one.
    pub fn elements_per_block(self, alignment: usize) -> usize {
        (alignment / self.size_of()).max(1)
    }
}

/// # DTypeClass
///
/// Several raw dtypes share identical tiling arithmetic. Planners select on the class and only
/// fall back to the concrete dtype where a kernel path genuinely differs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum DTypeClass {
    /// 1-byte integers, booleans and 8-bit float formats.
    Narrow8,
    /// 16-bit floats, widened to f32 inside the kernel.
    Half16,
    Native32,
    Wide64,
}

impl DTypeClass {
    pub fn width(&self) -> usize {
        match self {
            DTypeClass::Narrow8 => 1,
            DTypeClass::Half16 => 2,
            DTypeClass::Native32 => 4,
            DTypeClass::Wide64 => 8,
        }
    }
}

pub trait TilingDType: Copy + std::fmt::Debug + 'static {
    fn dt() -> DType;
}

macro_rules! map_type {
    ($t:ty, $v:ident) => {
        impl TilingDType for $t {
            fn dt() -> DType {
                DType::$v
            }
        }
    };
}

map_type!(f32, F32);
map_type!(f64, F64);
map_type!(i8, I8);
map_type!(u8, U8);
map_type!(i32, I32);
map_type!(i64, I64);
map_type!(bool, Bool);
map_type!(f16, F16);
map_type!(bf16, BF16);
