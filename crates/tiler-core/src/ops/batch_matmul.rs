use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    Align, BufferPlan, BufferSizer, CapacityModel, DType, Enforcer, InfeasibleError,
    InvariantError, MatmulKey, MatmulLayout, MatmulMode, OpGuards, OpParams, OpTiling, Operand,
    ParamBlock, PartitionPlan, PartitionPlanner, PartitionSection, ShrinkStep, TilingDescriptor, TilingError,
    VariantError, VariantKey, VariantSelector, WorkloadDescriptor, SYSTEM_WORKSPACE,
};

/// Edge of one cube fractal.
const CUBE_BLOCK: usize = 16;
/// One L0 operand buffer.
const L0_BYTES: usize = 32 * 1024;
const BIAS_TABLE_BYTES: usize = 1024;
const BIAS_BASE_N: usize = 256;
/// L1 bytes per output channel of the int8 requant scale.
const SCALE_BYTES: usize = 8;
/// Inner strides at or past this overflow the copy instructions.
const MAX_INNER_STRIDE: usize = 65536;
const INNER_ALIGN_BYTES: usize = 256;

fn last_power2(n: usize) -> usize {
    match n {
        0 => 0,
        n => 1 << (usize::BITS - 1 - n.leading_zeros()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatmulParams {
    pub batch: u64,
    pub m: u64,
    pub k: u64,
    pub n: u64,
    pub base_m: u64,
    pub base_n: u64,
    pub base_k: u64,
    pub depth_a1: u64,
    pub depth_b1: u64,
    pub step_ka: u64,
    pub step_kb: u64,
    pub single_core_m: u64,
    pub single_core_n: u64,
    pub single_core_k: u64,
    pub perm_x1: u64,
    pub perm_x2: u64,
    pub batch_split_factor: u64,
    pub has_bias: u64,
    pub blocks: u64,
    pub used_core_num: u64,
}

impl ParamBlock for MatmulParams {
    const LEN: usize = 20 * 8;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for v in [
            self.batch,
            self.m,
            self.k,
            self.n,
            self.base_m,
            self.base_n,
            self.base_k,
            self.depth_a1,
            self.depth_b1,
            self.step_ka,
            self.step_kb,
            self.single_core_m,
            self.single_core_n,
            self.single_core_k,
            self.perm_x1,
            self.perm_x2,
            self.batch_split_factor,
            self.has_bias,
            self.blocks,
            self.used_core_num,
        ] {
            w.write_u64::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

/// Logical problem size after reading the operand permutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dims {
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
}

impl Dims {
    fn is_empty(&self) -> bool {
        self.batch * self.m * self.k * self.n == 0
    }

    fn blocks(&self, base_m: usize, base_n: usize) -> usize {
        self.batch * self.m.ceil_div(base_m) * self.n.ceil_div(base_n)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BaseBlock {
    m: usize,
    n: usize,
    k: usize,
}

/// L1 staging depth of each operand. `depth = 2 * step` and one step divides the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct L1Depth {
    depth_a1: usize,
    depth_b1: usize,
    step_ka: usize,
    step_kb: usize,
}

impl L1Depth {
    fn new(l1: usize, width: usize, base: &BaseBlock) -> Self {
        let half = l1 / 2 / width;
        let depth = |edge: usize| {
            half.checked_div(edge * base.k)
                .unwrap_or(0)
                .align_down(4)
                .max(2)
        };
        let (mut step_ka, mut step_kb) = (depth(base.m) / 2, depth(base.n) / 2);
        if step_ka > step_kb {
            step_ka = step_ka / step_kb * step_kb;
        } else {
            step_kb = step_kb / step_ka * step_ka;
        }
        Self {
            depth_a1: 2 * step_ka,
            depth_b1: 2 * step_kb,
            step_ka,
            step_kb,
        }
    }

    /// One of the two ping-pong stages.
    fn stage_bytes(&self, width: usize, base: &BaseBlock) -> usize {
        (self.step_ka * base.m + self.step_kb * base.n) * base.k * width
    }
}

/// # MatmulTiling
///
/// Batched `x1 @ x2` with `x1` stored `[B, M, K]` or `[M, B, K]` and `x2` optionally transposed.
///
/// Chooses the L0 base block from power-of-two candidates, then packs as many `k` slices of
/// each operand into L1 as two ping-pong stages allow. Output blocks are dealt out balanced.
#[derive(Debug, Clone)]
pub struct MatmulTiling {
    x1: Operand,
    x2: Operand,
    bias: Option<Operand>,
    scale: Option<Operand>,
    mode: MatmulMode,
}

impl MatmulTiling {
    pub fn from_workload(mode: MatmulMode, workload: &WorkloadDescriptor) -> Result<Self, TilingError> {
        let expected = 2 + mode.bias as usize + mode.scale as usize;
        Enforcer::check_arity(&workload.operands, expected..=expected)?;
        let mut rest = workload.operands.iter().skip(2).cloned();
        let bias = if mode.bias { rest.next() } else { None };
        let scale = if mode.scale { rest.next() } else { None };
        Ok(Self {
            x1: workload.operands[0].clone(),
            x2: workload.operands[1].clone(),
            bias,
            scale,
            mode,
        })
    }

    /// `(dims, k of x2, batch of x2)`.
    fn dims(&self) -> (Dims, usize, usize) {
        let (a, b) = (&self.x1.shape, &self.x2.shape);
        let (batch, m, k) = match self.mode.layout {
            MatmulLayout::BatchFirst => (a[0], a[1], a[2]),
            MatmulLayout::RowsFirst => (a[1], a[0], a[2]),
        };
        let (batch_b, k_b, n) = if self.mode.transpose_x2 {
            (b[0], b[2], b[1])
        } else {
            (b[0], b[1], b[2])
        };
        (Dims { batch, m, k, n }, k_b, batch_b)
    }

    fn combination(&self, reason: String) -> TilingError {
        VariantError::UnsupportedCombination {
            op: self.name(),
            reason,
        }
        .into()
    }

    fn base_m(&self, d: &Dims, width: usize, divisor: usize) -> usize {
        let limit = if d.k >= 32 { 1024 } else { 2048 };
        let max_m = (limit / (width * divisor)).max(CUBE_BLOCK);
        let passes = d.m.ceil_div(max_m);
        d.m.ceil_div(passes).align_up(CUBE_BLOCK)
    }

    fn base_n(&self, d: &Dims, width: usize, divisor: usize, base_m: usize) -> usize {
        let min_n = (L0_BYTES / width / base_m).min(512 / width).max(32);
        let max_n = if self.mode.transpose_x2 && d.k >= 32 {
            1024
        } else {
            2048 / width / divisor
        };
        let mut best = d.n.next_power_of_two().min(max_n).max(CUBE_BLOCK);
        let mut candidate = best;
        // least padding of n, stopping at the first exact divisor
        while candidate >= min_n {
            if d.n % candidate == 0 {
                break;
            }
            if d.n.align_up(candidate) < d.n.align_up(best) {
                best = candidate;
            }
            candidate >>= 1;
        }
        last_power2(L0_BYTES / base_m)
            .min(best)
            .min(L0_BYTES / width / CUBE_BLOCK)
    }

    fn base_mn(&self, d: &Dims, width: usize, divisor: usize) -> (usize, usize) {
        let base_m = self.base_m(d, width, divisor);
        (base_m, self.base_n(d, width, divisor, base_m))
    }

    /// Halved blocks win when the full ones leave units idle or copy more per output.
    fn tune_base_mn(&self, d: &Dims, width: usize, unit_count: usize) -> (usize, usize) {
        let (om, on) = self.base_mn(d, width, 1);
        if self.x1.dtype == DType::F32 {
            return (om, on);
        }
        let (nm, nn) = self.base_mn(d, width, 2);
        let utilization = |bm: usize, bn: usize| {
            let blocks = d.blocks(bm, bn);
            (blocks as u128, blocks.align_up(unit_count) as u128)
        };
        let (oc, od) = utilization(om, on);
        let (nc, nd) = utilization(nm, nn);
        if 5 * oc < 3 * od && nc * od > oc * nd {
            return (nm, nn);
        }
        // 1/m + 1/n per block
        let (om, on, nm, nn) = (om as u128, on as u128, nm as u128, nn as u128);
        if (nm + nn) * om * on < (om + on) * nm * nn {
            return (nm as usize, nn as usize);
        }
        (om as usize, on as usize)
    }

    fn perms(&self) -> (u64, u64) {
        let x1 = match self.mode.layout {
            MatmulLayout::BatchFirst => 123,
            MatmulLayout::RowsFirst => 213,
        };
        let x2 = if self.mode.transpose_x2 { 132 } else { 123 };
        (x1, x2)
    }
}

impl OpGuards for MatmulTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        Enforcer::assert_rank_range(&self.x1, 3..=3)?;
        Enforcer::assert_rank_range(&self.x2, 3..=3)?;
        let (d, k_b, batch_b) = self.dims();
        if d.k != k_b {
            return Err(InvariantError::ShapeMismatch {
                left: 0,
                right: 1,
                a: d.k,
                b: k_b,
            }
            .into());
        }
        if d.batch != batch_b {
            return Err(InvariantError::ShapeMismatch {
                left: 0,
                right: 1,
                a: d.batch,
                b: batch_b,
            }
            .into());
        }
        if [d.batch, d.m, d.k, d.n].iter().any(|v| *v > i32::MAX as usize) {
            return Err(self.combination(format!("dimension of {d:?} past i32")));
        }
        if let Some(bias) = &self.bias {
            Enforcer::assert_rank_range(bias, 1..=1)?;
            if bias.shape[0] != d.n {
                return Err(InvariantError::ShapeMismatch {
                    left: 2,
                    right: 1,
                    a: bias.shape[0],
                    b: d.n,
                }
                .into());
            }
        }
        if let Some(scale) = &self.scale {
            if scale.numel() != d.batch * d.n {
                return Err(InvariantError::ShapeMismatch {
                    left: 2 + self.bias.is_some() as usize,
                    right: 1,
                    a: scale.numel(),
                    b: d.batch * d.n,
                }
                .into());
            }
        }

        let align = INNER_ALIGN_BYTES / self.x1.width();
        if d.k % align != 0 || d.n % align != 0 {
            return Err(self.combination(format!("k {} and n {} must be multiples of {align}", d.k, d.n)));
        }
        let stride = match self.mode.layout {
            MatmulLayout::BatchFirst => d.k,
            MatmulLayout::RowsFirst => d.batch * d.k,
        };
        if stride >= MAX_INNER_STRIDE {
            return Err(self.combination(format!("x1 row stride {stride}")));
        }
        if self.mode.batch_split_factor == 0 {
            return Err(self.combination("zero batch split factor".to_string()));
        }
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        if self.x1.dtype != self.x2.dtype {
            return Err(InvariantError::DTypeMismatch {
                expected: self.x1.dtype,
                actual: self.x2.dtype,
            }
            .into());
        }
        VariantSelector::matmul(
            self.name(),
            self.x1.dtype,
            self.mode.out,
            self.bias.as_ref().map(|b| b.dtype),
        )?;
        if self.scale.is_some() != (self.mode.out == DType::I8) {
            return Err(self.combination(format!(
                "output {} with scale present: {}",
                self.mode.out,
                self.scale.is_some()
            )));
        }
        Ok(())
    }
}

impl OpTiling for MatmulTiling {
    fn name(&self) -> &'static str {
        "transpose_batch_matmul"
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let (d, ..) = self.dims();
        let width = self.x1.width();
        let key = MatmulKey {
            batch_split: self.mode.batch_split_factor > 1,
            layout: self.mode.layout,
            transpose_x2: self.mode.transpose_x2,
        };
        let (perm_x1, perm_x2) = self.perms();
        let mut params = MatmulParams {
            batch: d.batch as u64,
            m: d.m as u64,
            k: d.k as u64,
            n: d.n as u64,
            single_core_k: d.k as u64,
            perm_x1,
            perm_x2,
            batch_split_factor: self.mode.batch_split_factor as u64,
            has_bias: self.bias.is_some() as u64,
            used_core_num: 1,
            ..Default::default()
        };
        let descriptor = |partition: PartitionPlan, buffer: BufferPlan, params: MatmulParams| TilingDescriptor {
            op: self.name(),
            variant: VariantKey::TransposeBatchMatmul(key),
            partition: PartitionSection::Even(partition),
            buffer,
            workspace: SYSTEM_WORKSPACE,
            params: OpParams::TransposeBatchMatmul(params),
        };
        if d.is_empty() {
            return Ok(descriptor(
                PartitionPlanner::ceil_block(0, 1, 1),
                BufferPlan::default(),
                params,
            ));
        }

        let (base_m, mut base_n) = self.tune_base_mn(&d, width, capacity.unit_count);
        let base_k = (L0_BYTES / width / base_m.max(base_n))
            .align_down(CUBE_BLOCK)
            .min(d.k.align_up(CUBE_BLOCK));

        let budget = capacity.scratch_budget;
        let mut reserved = 0;
        if self.scale.is_some() {
            reserved += d.batch * d.n * SCALE_BYTES;
        }
        if self.bias.is_some() {
            reserved += BIAS_TABLE_BYTES;
            base_n = base_n.min(BIAS_BASE_N);
        }
        let l1 = budget
            .checked_sub(reserved)
            .ok_or(InfeasibleError::Reserve { budget, reserved })?;

        let block = |k: usize| BaseBlock { m: base_m, n: base_n, k };
        let fits = |slices: usize| {
            let base = block(slices * CUBE_BLOCK);
            2 * L1Depth::new(l1, width, &base).stage_bytes(width, &base) <= l1
        };
        let slices = BufferSizer::shrink(base_k / CUBE_BLOCK, ShrinkStep::Halve, fits).map_err(
            |_| InfeasibleError::NoFit {
                op: self.name(),
                budget: l1,
            },
        )?;
        let base = block(slices * CUBE_BLOCK);
        let depth = L1Depth::new(l1, width, &base);

        let blocks = d.blocks(base.m, base.n);
        let partition = PartitionPlanner::balanced(blocks, capacity, 1)?;
        params.base_m = base.m as u64;
        params.base_n = base.n as u64;
        params.base_k = base.k as u64;
        params.depth_a1 = depth.depth_a1 as u64;
        params.depth_b1 = depth.depth_b1 as u64;
        params.step_ka = depth.step_ka as u64;
        params.step_kb = depth.step_kb as u64;
        params.single_core_m = d.m.min(base.m) as u64;
        params.single_core_n = d.n.min(base.n) as u64;
        params.blocks = blocks as u64;
        params.used_core_num = partition.units_used as u64;

        let buffer = BufferPlan {
            inner_tile: base.k,
            tile_bytes: depth.stage_bytes(width, &base),
            tile_rows: base.m,
            double_buffered: true,
            regions: 2,
            extra_reserved: reserved,
        };
        log::debug!(
            "{} {d:?} -> base {base:?}, depth {depth:?}, {blocks} blocks",
            self.name()
        );
        Ok(descriptor(partition, buffer, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, shape, OperatorKind, RVec, Shape};
    use test_strategy::{proptest, Arbitrary};

    fn mode(layout: MatmulLayout, transpose_x2: bool, out: DType, bias: bool) -> MatmulMode {
        MatmulMode::new(layout, transpose_x2, out, bias, out == DType::I8, 1)
    }

    fn tiling(mode: MatmulMode, operands: RVec<Operand>) -> anyhow::Result<MatmulTiling> {
        let workload = WorkloadDescriptor::new(operands, OperatorKind::TransposeBatchMatmul(mode));
        Ok(MatmulTiling::from_workload(mode, &workload)?)
    }

    fn params(desc: &TilingDescriptor) -> MatmulParams {
        match desc.params {
            OpParams::TransposeBatchMatmul(p) => p,
            _ => panic!("expected matmul params"),
        }
    }

    fn even(desc: &TilingDescriptor) -> &PartitionPlan {
        match &desc.partition {
            PartitionSection::Even(plan) => plan,
            PartitionSection::Ragged(_) => panic!("matmul plans are even"),
        }
    }

    fn l1(budget: usize) -> CapacityModel {
        CapacityModel::new(24, budget, 32, false)
    }

    fn half_problem() -> anyhow::Result<MatmulTiling> {
        tiling(
            mode(MatmulLayout::BatchFirst, false, DType::F16, false),
            rvec![
                Operand::new(shape![4, 256, 512], DType::F16),
                Operand::new(shape![4, 512, 1024], DType::F16),
            ],
        )
    }

    #[test]
    fn powers_of_two() {
        assert_eq!(last_power2(0), 0);
        assert_eq!(last_power2(292), 256);
        assert_eq!(last_power2(512), 512);
    }

    #[test]
    fn half_operands_fill_l1_exactly() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let capacity = l1(512 * 1024);
        let desc = half_problem()?.plan(&capacity)?;
        assert_eq!(desc.variant.code(), 0);
        let p = params(&desc);
        assert_eq!((p.base_m, p.base_n, p.base_k), (256, 128, 64));
        assert_eq!((p.depth_a1, p.depth_b1, p.step_ka, p.step_kb), (8, 16, 4, 8));
        assert_eq!((p.perm_x1, p.perm_x2), (123, 123));
        assert_eq!(desc.buffer.occupancy(), 512 * 1024);
        assert!(desc.buffer.fits(&capacity));

        let plan = even(&desc);
        assert_eq!(plan.outer, 32);
        assert_eq!((plan.units_used, plan.head_units, plan.head_len, plan.body_len), (24, 8, 2, 1));
        assert_eq!(p.used_core_num, 24);
        Ok(())
    }

    #[test]
    fn small_l1_shrinks_the_k_slice() -> anyhow::Result<()> {
        let capacity = l1(32 * 1024);
        let desc = half_problem()?.plan(&capacity)?;
        let p = params(&desc);
        assert_eq!(p.base_k, 16);
        assert_eq!((p.depth_a1, p.depth_b1), (2, 4));
        assert_eq!(desc.buffer.occupancy(), 32 * 1024);

        assert!(matches!(
            half_problem()?.plan(&l1(16 * 1024)),
            Err(TilingError::Infeasible(InfeasibleError::NoFit { .. }))
        ));
        Ok(())
    }

    #[test]
    fn tuning_prefers_squarer_blocks() -> anyhow::Result<()> {
        let t = tiling(
            mode(MatmulLayout::BatchFirst, false, DType::BF16, false),
            rvec![
                Operand::new(shape![1, 1024, 256], DType::BF16),
                Operand::new(shape![1, 256, 1024], DType::BF16),
            ],
        )?;
        let p = params(&t.plan(&l1(512 * 1024))?);
        assert_eq!((p.base_m, p.base_n, p.base_k), (256, 128, 64));
        Ok(())
    }

    #[test]
    fn bias_caps_base_n_and_takes_l1() -> anyhow::Result<()> {
        let t = tiling(
            mode(MatmulLayout::BatchFirst, true, DType::F32, true),
            rvec![
                Operand::new(shape![2, 100, 64], DType::F32),
                Operand::new(shape![2, 512, 64], DType::F32),
                Operand::new(shape![512], DType::F32),
            ],
        )?;
        let capacity = l1(256 * 1024);
        let desc = t.plan(&capacity)?;
        assert_eq!(desc.variant.code(), 1);
        let p = params(&desc);
        assert_eq!((p.base_m, p.base_n, p.base_k), (112, 256, 32));
        assert_eq!((p.depth_a1, p.depth_b1), (8, 2));
        assert_eq!((p.single_core_m, p.single_core_n), (100, 256));
        assert_eq!((p.perm_x2, p.has_bias), (132, 1));
        assert_eq!(desc.buffer.extra_reserved, BIAS_TABLE_BYTES);
        assert_eq!(desc.units_used(), 4);
        assert!(desc.buffer.fits(&capacity));
        Ok(())
    }

    #[test]
    fn rows_first_layout_reads_batch_from_the_middle() -> anyhow::Result<()> {
        let mut m = mode(MatmulLayout::RowsFirst, false, DType::F16, false);
        m.batch_split_factor = 2;
        let t = tiling(
            m,
            rvec![
                Operand::new(shape![64, 8, 256], DType::F16),
                Operand::new(shape![8, 256, 128], DType::F16),
            ],
        )?;
        let desc = t.plan(&l1(512 * 1024))?;
        assert_eq!(desc.variant.code(), 120);
        let p = params(&desc);
        assert_eq!((p.batch, p.m, p.k, p.n), (8, 64, 256, 128));
        assert_eq!((p.base_m, p.base_n, p.base_k), (64, 128, 128));
        assert_eq!((p.perm_x1, p.batch_split_factor), (213, 2));
        assert_eq!(desc.units_used(), 8);
        Ok(())
    }

    #[test]
    fn quantized_output_reserves_the_scale() -> anyhow::Result<()> {
        let t = tiling(
            mode(MatmulLayout::BatchFirst, false, DType::I8, false),
            rvec![
                Operand::new(shape![4, 256, 512], DType::F16),
                Operand::new(shape![4, 512, 1024], DType::F16),
                Operand::new(shape![4, 1024], DType::F32),
            ],
        )?;
        let capacity = l1(512 * 1024);
        let desc = t.plan(&capacity)?;
        assert_eq!(desc.buffer.extra_reserved, 4 * 1024 * SCALE_BYTES);
        assert!(desc.buffer.fits(&capacity));
        Ok(())
    }

    #[test]
    fn empty_batch_is_one_idle_unit() -> anyhow::Result<()> {
        let t = tiling(
            mode(MatmulLayout::BatchFirst, false, DType::F16, false),
            rvec![
                Operand::new(shape![0, 256, 512], DType::F16),
                Operand::new(shape![0, 512, 1024], DType::F16),
            ],
        )?;
        let desc = t.plan(&l1(512 * 1024))?;
        assert_eq!(desc.units_used(), 1);
        assert!(even(&desc).is_empty());
        assert_eq!(params(&desc).used_core_num, 1);
        assert_eq!(desc.to_bytes()?.len(), desc.encoded_len());
        Ok(())
    }

    #[test]
    fn invalid_products() -> anyhow::Result<()> {
        let capacity = l1(512 * 1024);
        let half = |x1: Shape, x2: Shape| {
            tiling(
                mode(MatmulLayout::BatchFirst, false, DType::F16, false),
                rvec![
                    Operand::new(x1, DType::F16),
                    Operand::new(x2, DType::F16),
                ],
            )
        };
        assert!(matches!(
            half(shape![4, 256, 512], shape![4, 256, 1024])?.plan(&capacity),
            Err(TilingError::Invariant(InvariantError::ShapeMismatch { a: 512, b: 256, .. }))
        ));
        assert!(matches!(
            half(shape![4, 256, 512], shape![2, 512, 1024])?.plan(&capacity),
            Err(TilingError::Invariant(InvariantError::ShapeMismatch { a: 4, b: 2, .. }))
        ));
        assert!(matches!(
            half(shape![4, 256, 100], shape![4, 100, 1024])?.plan(&capacity),
            Err(TilingError::Variant(VariantError::UnsupportedCombination { .. }))
        ));
        assert!(matches!(
            half(shape![1, 16, 65536], shape![1, 65536, 128])?.plan(&capacity),
            Err(TilingError::Variant(VariantError::UnsupportedCombination { .. }))
        ));

        let mixed = tiling(
            mode(MatmulLayout::BatchFirst, false, DType::F16, false),
            rvec![
                Operand::new(shape![4, 256, 512], DType::F16),
                Operand::new(shape![4, 512, 1024], DType::F32),
            ],
        )?;
        assert!(matches!(
            mixed.plan(&capacity),
            Err(TilingError::Invariant(InvariantError::DTypeMismatch { .. }))
        ));

        let mut unscaled = mode(MatmulLayout::BatchFirst, false, DType::I8, false);
        unscaled.scale = false;
        let t = tiling(
            unscaled,
            rvec![
                Operand::new(shape![4, 256, 512], DType::F16),
                Operand::new(shape![4, 512, 1024], DType::F16),
            ],
        )?;
        assert!(matches!(
            t.plan(&capacity),
            Err(TilingError::Variant(VariantError::UnsupportedCombination { .. }))
        ));
        Ok(())
    }

    #[derive(Arbitrary, Debug)]
    struct MatmulProblem {
        #[strategy(1..=8usize)]
        batch: usize,
        #[strategy(1..=2048usize)]
        m: usize,
        #[strategy(1..=16usize)]
        k_blocks: usize,
        #[strategy(1..=16usize)]
        n_blocks: usize,
        transpose_x2: bool,
        #[strategy(proptest::sample::select(vec![DType::F16, DType::BF16, DType::F32]))]
        dtype: DType,
        #[strategy(128..=1024usize)]
        l1_kib: usize,
    }

    #[proptest(cases = 256)]
    fn every_product_is_covered(prob: MatmulProblem) {
        let (k, n) = (128 * prob.k_blocks, 128 * prob.n_blocks);
        let x2 = if prob.transpose_x2 {
            shape![prob.batch, n, k]
        } else {
            shape![prob.batch, k, n]
        };
        let t = tiling(
            mode(MatmulLayout::BatchFirst, prob.transpose_x2, prob.dtype, false),
            rvec![
                Operand::new(shape![prob.batch, prob.m, k], prob.dtype),
                Operand::new(x2, prob.dtype),
            ],
        )
        .unwrap();
        let capacity = l1(prob.l1_kib * 1024);
        let desc = t.plan(&capacity).unwrap();
        assert!(desc.buffer.fits(&capacity));
        let p = params(&desc);
        assert!(p.base_k >= CUBE_BLOCK as u64 && p.base_k % CUBE_BLOCK as u64 == 0);
        assert!(p.base_k * p.base_m.max(p.base_n) * prob.dtype.size_of() as u64 <= L0_BYTES as u64);
        assert_eq!(p.depth_a1 % p.step_ka, 0);
        let plan = even(&desc);
        assert_eq!(plan.ranges().last().map(|r| r.end), Some(plan.outer));
    }
}
