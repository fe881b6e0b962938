use std::io::Write;
use std::ops::RangeInclusive;

use byteorder::{LittleEndian, WriteBytesExt};
use derive_new::new;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    Align, BufferPlan, BufferRequest, BufferSizer, CapacityModel, ConfigError, DType, DTypeClass,
    DTypeSupport, Enforcer, ForeachKey, OpGuards, OpParams, OpTiling, Operand, ParamBlock,
    PartitionPlanner, PartitionSection, RVec, TilingDescriptor, TilingError, VariantError,
    VariantKey, VariantSelector, WorkloadDescriptor, WorkspacePolicy, WorkspaceSizer, BLOCK_BYTES,
    HEADER_LEN, MAX_TENSORS, MAX_UNITS, RAGGED_SECTION_LEN, REPEAT_BYTES,
};

/// Temporary widening casts keep one tenth of the usable scratch for data.
pub const CAST_DIVIDER: usize = 10;
/// Foreach kernels need no real workspace, the launcher still wants a non-zero size.
pub const FOREACH_WORKSPACE: usize = 32;

/// # ForeachOp
///
/// Batched elementwise kernels over a list of tensors. The discriminant is the op code the
/// kernel family is compiled against, each op stands for every frontend op sharing its
/// scratch layout (e.g. `cosh` also serves `asin` and `acos`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[repr(u8)]
pub enum ForeachOp {
    AddScalar = 1,
    Log = 2,
    BinaryList = 3,
    Pointwise = 4,
    Cos = 5,
    Log2 = 6,
    Neg = 7,
    PowList = 8,
    BinaryScalar = 9,
    PointwiseList = 10,
    Sigmoid = 11,
    Erf = 12,
    Cosh = 13,
    Sinh = 14,
    Tan = 15,
    Erfc = 16,
    Tanh = 17,
    Atan = 18,
    LerpScalar = 19,
    LerpList = 20,
    PowScalar = 21,
    PowScalarAndTensor = 22,
    Sin = 23,
    Abs = 24,
    MulScalar = 25,
    Exp = 26,
    MaximumList = 27,
    AddList = 28,
    RoundOff = 29,
    SubScalar = 30,
    DivScalar = 31,
    Copy = 32,
    Sign = 33,
}

impl ForeachOp {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, VariantError> {
        let group = ForeachGroup::from_code(code)?;
        let found = group.ops().find(|op| op.code() == code);
        found.ok_or(VariantError::UnknownOpCode(code))
    }

    pub fn group(&self) -> ForeachGroup {
        use ForeachOp::*;
        match self {
            AddScalar | Log | BinaryList | Pointwise => ForeachGroup::Base,
            Cos | Log2 | Neg | PowList => ForeachGroup::Approx,
            BinaryScalar | PointwiseList | Sigmoid | Erf => ForeachGroup::ScalarList,
            Cosh | Sinh | Tan => ForeachGroup::Hyperbolic,
            Erfc | Tanh | Atan => ForeachGroup::ErrorFn,
            LerpScalar | LerpList | PowScalar | PowScalarAndTensor => ForeachGroup::LerpPow,
            Sin | Abs | MulScalar => ForeachGroup::SinAbs,
            Exp | MaximumList | AddList => ForeachGroup::ExpList,
            RoundOff | SubScalar | DivScalar | Copy => ForeachGroup::Rounding,
            Sign => ForeachGroup::Sign,
        }
    }

    pub fn support(&self) -> DTypeSupport {
        use ForeachOp::*;
        match self {
            AddScalar | BinaryList | Pointwise | Neg | PowList | BinaryScalar | PointwiseList
            | Abs | MulScalar | MaximumList | AddList | SubScalar | DivScalar => {
                DTypeSupport::Arithmetic
            }
            Log | Cos | Log2 | Sigmoid | Erf | Cosh | Sinh | Tan | Erfc | Tanh | Atan
            | LerpScalar | LerpList | PowScalar | PowScalarAndTensor | Sin | Exp | RoundOff => {
                DTypeSupport::Float
            }
            Copy => DTypeSupport::Copy,
            Sign => DTypeSupport::Sign,
        }
    }
}

/// Op codes come in contiguous bands that share a scratch layout routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ForeachGroup {
    Base,
    Approx,
    ScalarList,
    Hyperbolic,
    ErrorFn,
    LerpPow,
    SinAbs,
    ExpList,
    Rounding,
    Sign,
}

impl ForeachGroup {
    pub fn from_code(code: u8) -> Result<Self, VariantError> {
        match code {
            1..=4 => Ok(ForeachGroup::Base),
            5..=8 => Ok(ForeachGroup::Approx),
            9..=12 => Ok(ForeachGroup::ScalarList),
            13..=15 => Ok(ForeachGroup::Hyperbolic),
            16..=18 => Ok(ForeachGroup::ErrorFn),
            19..=22 => Ok(ForeachGroup::LerpPow),
            23..=25 => Ok(ForeachGroup::SinAbs),
            26..=28 => Ok(ForeachGroup::ExpList),
            29..=32 => Ok(ForeachGroup::Rounding),
            33 => Ok(ForeachGroup::Sign),
            _ => Err(VariantError::UnknownOpCode(code)),
        }
    }

    pub fn codes(&self) -> RangeInclusive<u8> {
        match self {
            ForeachGroup::Base => 1..=4,
            ForeachGroup::Approx => 5..=8,
            ForeachGroup::ScalarList => 9..=12,
            ForeachGroup::Hyperbolic => 13..=15,
            ForeachGroup::ErrorFn => 16..=18,
            ForeachGroup::LerpPow => 19..=22,
            ForeachGroup::SinAbs => 23..=25,
            ForeachGroup::ExpList => 26..=28,
            ForeachGroup::Rounding => 29..=32,
            ForeachGroup::Sign => 33..=33,
        }
    }

    pub fn ops(&self) -> impl Iterator<Item = ForeachOp> + '_ {
        ForeachOp::iter().filter(move |op| op.group() == *self)
    }
}

/// Number of equal scratch regions an op carves its budget into, depth included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regions {
    Fixed(usize),
    /// Approximations keep more f32 temporaries live for 16-bit inputs.
    ByWidth { half: usize, float: usize },
    /// A base count plus a per-dtype cost indexed by foreach key. Cast dtypes fold the cast into
    /// their own base instead of holding scratch back.
    Keyed {
        base: usize,
        cast_base: usize,
        cost: [usize; 9],
    },
}

/// Byte counts of the form `unit * factor * width`, or a flat amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bytes {
    None,
    Fixed(usize),
    ByWidth {
        unit: usize,
        half: usize,
        float: usize,
    },
}

impl Bytes {
    pub fn resolve(&self, class: DTypeClass) -> usize {
        match *self {
            Bytes::None => 0,
            Bytes::Fixed(b) => b,
            Bytes::ByWidth { unit, half, float } => {
                let factor = match class {
                    DTypeClass::Native32 => float,
                    _ => half,
                };
                unit * factor * class.width()
            }
        }
    }
}

/// # ReserveEntry
///
/// Scratch accounting constants for one foreach op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReserveEntry {
    pub regions: Regions,
    pub reserve: Bytes,
    /// Restrict `reserve` to these dtypes, `None` applies it to all.
    pub reserve_for: Option<&'static [DType]>,
    pub attenuate: bool,
    pub slack: Bytes,
    pub cast: &'static [DType],
    pub wide: &'static [DType],
    /// Scale regions by `repeat / (repeat + 2 * width)` to make room for a gather mask.
    pub mask_ratio: bool,
    pub repeat_align: Option<usize>,
}

const BF16_ONLY: &[DType] = &[DType::BF16];
const HALF_TYPES: &[DType] = &[DType::BF16, DType::F16];

impl ReserveEntry {
    const fn regions(n: usize) -> Self {
        Self {
            regions: Regions::Fixed(n),
            reserve: Bytes::None,
            reserve_for: None,
            attenuate: false,
            slack: Bytes::None,
            cast: BF16_ONLY,
            wide: BF16_ONLY,
            mask_ratio: false,
            repeat_align: None,
        }
    }

    const fn by_width(half: usize, float: usize) -> Self {
        let mut entry = Self::regions(0);
        entry.regions = Regions::ByWidth { half, float };
        entry
    }

    const fn reserve(mut self, reserve: Bytes) -> Self {
        self.reserve = reserve;
        self
    }

    const fn slack(mut self, slack: Bytes) -> Self {
        self.slack = slack;
        self
    }

    const fn cast(mut self, cast: &'static [DType], wide: &'static [DType]) -> Self {
        self.cast = cast;
        self.wide = wide;
        self
    }

    fn region_count(&self, dtype: DType, key: ForeachKey) -> Option<usize> {
        match self.regions {
            Regions::Fixed(n) => Some(n),
            Regions::ByWidth { half, float } => match dtype.class() {
                DTypeClass::Native32 => Some(float),
                _ => Some(half),
            },
            Regions::Keyed {
                base,
                cast_base,
                cost,
            } => {
                let extra = cost.get((key.code() as usize).checked_sub(1)?)?;
                let base = if dtype == DType::BF16 { cast_base } else { base };
                Some(base + extra)
            }
        }
    }

    /// The preserved constants for `op`.
    pub fn default_for(op: ForeachOp) -> Self {
        use ForeachOp::*;
        const POW_COST: [usize; 9] = [12, 3, 5, 3, 12, 12, 12, 12, 12];
        match op {
            AddScalar | MulScalar => Self::regions(2),
            Log | Exp => Self::regions(2).reserve(Bytes::Fixed(1024)),
            BinaryList | MaximumList | AddList => Self::regions(6),
            Pointwise => Self::regions(8).cast(HALF_TYPES, HALF_TYPES),
            Cos => Self::regions(4).reserve(Bytes::ByWidth {
                unit: 32,
                half: 6,
                float: 4,
            }),
            Log2 => Self::regions(2).slack(Bytes::ByWidth {
                unit: 1024,
                half: 4,
                float: 0,
            }),
            Neg => Self::regions(2).slack(Bytes::Fixed(BLOCK_BYTES)),
            PowList => {
                let mut entry = Self::regions(0).cast(&[], BF16_ONLY);
                entry.regions = Regions::Keyed {
                    base: 6,
                    cast_base: 6 * CAST_DIVIDER,
                    cost: POW_COST,
                };
                entry
            }
            BinaryScalar => Self::regions(4),
            PointwiseList => Self::regions(8),
            Sigmoid => Self::regions(4).reserve(Bytes::Fixed(1024)),
            Erf => Self::by_width(4 * 9, 4 * 4),
            Erfc => Self::by_width(4 * 17, 4 * 8),
            Cosh => Self::regions(4).reserve(Bytes::ByWidth {
                unit: 8 * 1024,
                half: 6,
                float: 2,
            }),
            Sinh => Self::regions(4).reserve(Bytes::ByWidth {
                unit: 1024,
                half: 4,
                float: 1,
            }),
            Tan | Atan => {
                let mut entry = Self::regions(4).reserve(Bytes::ByWidth {
                    unit: 8 * 1024,
                    half: 10,
                    float: 4,
                });
                entry.attenuate = true;
                entry
            }
            Tanh => Self::by_width(5 + 2, 6 + 2).reserve(Bytes::Fixed(1024)),
            LerpScalar => Self::regions(6)
                .reserve(Bytes::Fixed(128))
                .cast(HALF_TYPES, HALF_TYPES),
            LerpList => {
                let mut entry = Self::regions(11).cast(HALF_TYPES, HALF_TYPES);
                entry.repeat_align = Some(REPEAT_BYTES);
                entry
            }
            PowScalar | PowScalarAndTensor => Self::regions(4).reserve(Bytes::ByWidth {
                unit: BLOCK_BYTES,
                half: 14,
                float: 4,
            }),
            Sin => Self::regions(4).reserve(Bytes::ByWidth {
                unit: 8 * 1024,
                half: 6,
                float: 2,
            }),
            Abs => Self::regions(4).reserve(Bytes::Fixed(2048)),
            RoundOff => {
                let mut entry = Self::regions(2).cast(HALF_TYPES, HALF_TYPES);
                entry.mask_ratio = true;
                entry
            }
            SubScalar | DivScalar => Self::regions(4)
                .reserve(Bytes::Fixed(BLOCK_BYTES))
                .cast(HALF_TYPES, HALF_TYPES),
            Copy => Self::regions(1).cast(BF16_ONLY, &[]),
            Sign => {
                let mut entry = Self::regions(4)
                    .reserve(Bytes::ByWidth {
                        unit: 8 * 1024,
                        half: 3,
                        float: 3,
                    })
                    .cast(&[DType::BF16, DType::I64, DType::I8], BF16_ONLY);
                entry.reserve_for = Some(&[DType::F32, DType::F16]);
                entry
            }
        }
    }

    pub fn request(
        &self,
        dtype: DType,
        key: ForeachKey,
        overhead: usize,
    ) -> Option<BufferRequest> {
        let class = dtype.class();
        let width = class.width();
        let regions = self.region_count(dtype, key)?;
        // even region counts are double-buffered pairs
        let double = regions % 2 == 0;
        let live = if double { regions / 2 } else { regions };

        let reserve = match self.reserve_for {
            Some(dtypes) if !dtypes.contains(&dtype) => 0,
            _ => self.reserve.resolve(class),
        };
        let mut req = BufferRequest::new(width, live, double)
            .with_overhead(overhead)
            .with_reserve(reserve, self.attenuate)
            .with_slack(self.slack.resolve(class))
            .with_wide_alignment(self.wide.contains(&dtype));
        if self.cast.contains(&dtype) {
            req = req.with_cast(CAST_DIVIDER);
        }
        if self.mask_ratio {
            req = req.with_ratio(REPEAT_BYTES, REPEAT_BYTES + 2 * width);
        }
        if let Some(align) = self.repeat_align {
            req = req.with_repeat_align(align);
        }
        Some(req)
    }
}

/// # ReserveTable
///
/// Per-op scratch constants, passed into planning instead of living in globals.
/// `Default` carries the values every shipped kernel was tuned against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveTable {
    entries: FxHashMap<ForeachOp, ReserveEntry>,
}

impl Default for ReserveTable {
    fn default() -> Self {
        Self {
            entries: ForeachOp::iter()
                .map(|op| (op, ReserveEntry::default_for(op)))
                .collect(),
        }
    }
}

impl ReserveTable {
    pub fn empty() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    pub fn get(&self, op: ForeachOp) -> Result<&ReserveEntry, ConfigError> {
        self.entries.get(&op).ok_or(ConfigError::MissingReserve(op))
    }

    pub fn insert(&mut self, op: ForeachOp, entry: ReserveEntry) -> Option<ReserveEntry> {
        self.entries.insert(op, entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct ForeachParams {
    pub op_code: u32,
    pub elements_per_block: u32,
}

impl ParamBlock for ForeachParams {
    const LEN: usize = 8;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(self.op_code)?;
        w.write_u32::<LittleEndian>(self.elements_per_block)
    }
}

/// Bytes of the record a foreach kernel copies into scratch before anything else.
pub const FOREACH_RECORD_LEN: usize = HEADER_LEN + RAGGED_SECTION_LEN + ForeachParams::LEN;

#[derive(Debug, Clone)]
pub struct ForeachTiling {
    op: ForeachOp,
    operands: RVec<Operand>,
    entry: ReserveEntry,
}

impl ForeachTiling {
    pub fn from_workload(
        op: ForeachOp,
        workload: &WorkloadDescriptor,
        table: &ReserveTable,
    ) -> Result<Self, TilingError> {
        Ok(Self {
            op,
            operands: workload.operands.clone(),
            entry: *table.get(op)?,
        })
    }

    fn dtype(&self) -> DType {
        self.operands.first().map(|o| o.dtype).unwrap_or_default()
    }

    fn rows(&self) -> Vec<usize> {
        self.operands.iter().map(Operand::numel).collect_vec()
    }

    fn buffer(&self, key: ForeachKey, capacity: &CapacityModel) -> Result<BufferPlan, TilingError> {
        let dtype = self.dtype();
        let req = self
            .entry
            .request(dtype, key, FOREACH_RECORD_LEN)
            .ok_or(VariantError::UnsupportedDType {
                op: self.name(),
                dtype,
            })?;
        Ok(BufferSizer::closed_form(&req, capacity)?)
    }
}

impl OpGuards for ForeachTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        Enforcer::check_max_operands(&self.operands, MAX_TENSORS)?;
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        let dtype = Enforcer::check_dtype_match(&self.operands)?;
        VariantSelector::foreach(self.name(), self.op.support(), dtype)?;
        Ok(())
    }
}

impl OpTiling for ForeachTiling {
    fn name(&self) -> &'static str {
        self.op.into()
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let dtype = self.dtype();
        let key = VariantSelector::foreach(self.name(), self.op.support(), dtype)?;

        let rows = self.rows();
        let epb = dtype.elements_per_block(BLOCK_BYTES);
        let total: usize = rows.iter().sum();
        let units = capacity
            .unit_count
            .min(MAX_UNITS)
            .min(total.ceil_div(epb))
            .max(1);
        let limited = CapacityModel {
            unit_count: units,
            ..capacity.clone()
        };
        let ragged = PartitionPlanner::ragged(&rows, &limited, epb)?;
        let buffer = self.buffer(key, capacity)?;
        let workspace = WorkspaceSizer::size(&WorkspacePolicy::fixed(FOREACH_WORKSPACE), 0, units);

        log::debug!(
            "{} over {} tensors ({total} elements) on {units} units, tile {} bytes",
            self.name(),
            rows.len(),
            buffer.tile_bytes
        );
        Ok(TilingDescriptor {
            op: self.name(),
            variant: VariantKey::Foreach(key),
            partition: PartitionSection::Ragged(ragged),
            buffer,
            workspace,
            params: OpParams::Foreach(ForeachParams::new(self.op.code() as u32, epb as u32)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, shape, InvariantError, OperatorKind};
    use test_strategy::{proptest, Arbitrary};

    fn standard() -> CapacityModel {
        CapacityModel::new(48, 196_608, 32, true)
    }

    fn workload(op: ForeachOp, dtype: DType, rows: &[usize]) -> WorkloadDescriptor {
        let operands: RVec<Operand> = rows
            .iter()
            .map(|r| Operand::new(shape![*r], dtype))
            .collect();
        WorkloadDescriptor::new(operands, OperatorKind::Foreach(op))
    }

    fn plan(op: ForeachOp, dtype: DType, rows: &[usize]) -> Result<TilingDescriptor, TilingError> {
        let table = ReserveTable::default();
        ForeachTiling::from_workload(op, &workload(op, dtype, rows), &table)?.plan(&standard())
    }

    #[test]
    fn groups_partition_the_code_space() {
        let mut expected = 1u8;
        for group in ForeachGroup::iter() {
            let codes = group.codes();
            assert_eq!(*codes.start(), expected);
            expected = codes.end() + 1;
            let ops = group.ops().map(|op| op.code()).collect_vec();
            assert_eq!(ops, codes.collect_vec());
        }
        assert_eq!(expected, 34);
    }

    #[test]
    fn codes_resolve() -> anyhow::Result<()> {
        for op in ForeachOp::iter() {
            assert_eq!(ForeachOp::from_code(op.code())?, op);
        }
        assert!(matches!(ForeachOp::from_code(0), Err(VariantError::UnknownOpCode(0))));
        assert!(matches!(ForeachOp::from_code(34), Err(VariantError::UnknownOpCode(34))));
        assert_eq!("pow_scalar_and_tensor".parse::<ForeachOp>()?, ForeachOp::PowScalarAndTensor);
        Ok(())
    }

    #[test]
    fn binary_list_f32() -> anyhow::Result<()> {
        let desc = plan(ForeachOp::BinaryList, DType::F32, &[1024, 4096])?;
        let usable = 196_608 - FOREACH_RECORD_LEN;
        let expected = (usable / 6).align_down(32);
        assert_eq!(desc.buffer.tile_bytes, expected);
        assert_eq!(desc.buffer.inner_tile, expected / 4);
        assert!(desc.buffer.double_buffered);
        assert_eq!(desc.variant.code(), 2);
        assert_eq!(desc.workspace, 32);
        Ok(())
    }

    #[test]
    fn bf16_casts_with_wide_alignment() -> anyhow::Result<()> {
        let desc = plan(ForeachOp::AddScalar, DType::BF16, &[4096])?;
        let usable = (196_608 - FOREACH_RECORD_LEN) / CAST_DIVIDER;
        assert_eq!(desc.buffer.tile_bytes, (usable / 2).align_down(64));
        assert_eq!(desc.variant.code(), 4);
        Ok(())
    }

    #[test]
    fn lerp_list_is_repeat_aligned() -> anyhow::Result<()> {
        let desc = plan(ForeachOp::LerpList, DType::F16, &[10_000])?;
        assert_eq!(desc.buffer.tile_bytes % 256, 0);
        assert!(!desc.buffer.double_buffered);
        assert_eq!(desc.buffer.regions, 11);
        Ok(())
    }

    #[test]
    fn tanh_regions_depend_on_width() -> anyhow::Result<()> {
        assert_eq!(plan(ForeachOp::Tanh, DType::F32, &[64])?.buffer.regions, 8);
        assert_eq!(plan(ForeachOp::Tanh, DType::F16, &[64])?.buffer.regions, 7);
        Ok(())
    }

    #[test]
    fn width_scaled_bytes_follow_the_class() {
        let bytes = Bytes::ByWidth {
            unit: 32,
            half: 3,
            float: 1,
        };
        assert_eq!(bytes.resolve(DType::F16.class()), 192);
        assert_eq!(bytes.resolve(DType::BF16.class()), 192);
        assert_eq!(bytes.resolve(DType::F32.class()), 128);
        assert_eq!(bytes.resolve(DType::I32.class()), 128);
        assert_eq!(Bytes::Fixed(7).resolve(DTypeClass::Wide64), 7);
        assert_eq!(Bytes::None.resolve(DTypeClass::Narrow8), 0);

        let entry = ReserveEntry::by_width(7, 8);
        let key = ForeachKey::F32;
        assert_eq!(entry.region_count(DType::I32, key), Some(8));
        assert_eq!(entry.region_count(DType::BF16, key), Some(7));
    }

    #[test]
    fn pow_list_cost_by_key() -> anyhow::Result<()> {
        assert_eq!(plan(ForeachOp::PowList, DType::F16, &[64])?.buffer.regions, 18);
        assert_eq!(plan(ForeachOp::PowList, DType::I32, &[64])?.buffer.regions, 11);
        assert_eq!(plan(ForeachOp::PowList, DType::BF16, &[64])?.buffer.regions, 63);
        Ok(())
    }

    #[test]
    fn tan_reserve_attenuates_on_small_scratch() -> anyhow::Result<()> {
        let table = ReserveTable::default();
        let work = workload(ForeachOp::Tan, DType::F16, &[512]);
        let small = CapacityModel::new(8, 96 * 1024, 32, false);
        let desc = ForeachTiling::from_workload(ForeachOp::Tan, &work, &table)?.plan(&small)?;
        assert!(desc.buffer.fits(&small));
        Ok(())
    }

    #[test]
    fn unsupported_dtype() {
        assert!(matches!(
            plan(ForeachOp::Exp, DType::I32, &[64]),
            Err(TilingError::Variant(VariantError::UnsupportedDType { op: "exp", .. }))
        ));
        assert!(plan(ForeachOp::Copy, DType::Bool, &[64]).is_ok());
        assert!(plan(ForeachOp::Sign, DType::I8, &[64]).is_ok());
    }

    #[test]
    fn empty_list_is_one_idle_unit() -> anyhow::Result<()> {
        let desc = plan(ForeachOp::AddList, DType::F32, &[])?;
        assert_eq!(desc.units_used(), 1);
        let desc = plan(ForeachOp::AddList, DType::F32, &[0, 0])?;
        assert_eq!(desc.units_used(), 1);
        Ok(())
    }

    #[test]
    fn missing_reserve_entry() -> anyhow::Result<()> {
        let work = workload(ForeachOp::Abs, DType::F32, &[64]);
        assert!(matches!(
            ForeachTiling::from_workload(ForeachOp::Abs, &work, &ReserveTable::empty()),
            Err(TilingError::Config(ConfigError::MissingReserve(ForeachOp::Abs)))
        ));
        Ok(())
    }

    #[test]
    fn too_many_tensors() {
        let rows = vec![8; MAX_TENSORS + 1];
        assert!(matches!(
            plan(ForeachOp::Copy, DType::F32, &rows),
            Err(TilingError::Invariant(InvariantError::TooManyOperands { .. }))
        ));
    }

    #[test]
    fn mixed_list_is_rejected() {
        let op = ForeachOp::AddList;
        let work = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![16], DType::F32),
                Operand::new(shape![16], DType::F16)
            ],
            OperatorKind::Foreach(op),
        );
        let tiling = ForeachTiling::from_workload(op, &work, &ReserveTable::default()).unwrap();
        assert!(matches!(
            tiling.plan(&standard()),
            Err(TilingError::Invariant(InvariantError::DTypeMismatch { .. }))
        ));
    }

    #[derive(Arbitrary, Debug)]
    struct ForeachProblem {
        op: ForeachOp,
        #[strategy(proptest::sample::select(vec![DType::F16, DType::F32, DType::BF16]))]
        dtype: DType,
        #[strategy(proptest::collection::vec(0..50_000usize, 0..8))]
        rows: Vec<usize>,
    }

    #[proptest(cases = 128)]
    fn plans_fit_and_cover(prob: ForeachProblem) {
        let desc = plan(prob.op, prob.dtype, &prob.rows).unwrap();
        assert!(desc.buffer.fits(&standard()));
        assert!(desc.units_used() >= 1 && desc.units_used() <= MAX_UNITS);
        let PartitionSection::Ragged(ragged) = &desc.partition else {
            panic!("foreach plans are ragged");
        };
        let covered: usize = ragged.spans.iter().map(|s| s.len).sum();
        assert_eq!(covered, prob.rows.iter().sum::<usize>());
    }
}
