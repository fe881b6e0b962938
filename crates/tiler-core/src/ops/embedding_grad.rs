use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use derive_new::new;

use crate::{
    loop_tail, Align, BufferPlan, BufferSizer, CapacityModel, EmbeddingGradKey, EmbeddingGradMode, Enforcer,
    GradKey, InfeasibleError, IndexKey, InvariantError, OpGuards, OpParams, OpTiling, Operand,
    ParamBlock, PartitionPlanner, PartitionSection, SpillRule, TilingDescriptor, TilingError,
    VariantKey, VariantSelector, WorkloadDescriptor, WorkspacePolicy, WorkspaceSizer,
    CACHE_LINE_BYTES, SYSTEM_WORKSPACE,
};

/// Index lists up to this length are sorted in a single pass.
pub const FULL_LOAD_INDICES: usize = 1024;
const SORT_PADDING: usize = 64;
const INDEX_BUFFERS: usize = 5;
const PROCESS_GROUP: usize = 5;
const CLEAR_BLOCK_BYTES: usize = 1024;
const NARROW_BASE_A: usize = 8;

/// Scratch the radix sort needs for `n` indices.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct SortScratch {
    pub per_element: usize,
    pub fixed: usize,
}

impl SortScratch {
    pub fn for_index(index: IndexKey) -> Self {
        Self::new(2 * (index.width() + 4), 512)
    }

    pub fn bytes(&self, n: usize) -> usize {
        self.fixed + n * self.per_element
    }
}

/// Widest block-aligned column tile within `per_core`. Columns past it fall to the tail loop.
fn aligned_columns(per_core: usize, align: usize) -> usize {
    match per_core.align_down(align) {
        0 => per_core,
        a => a,
    }
}

/// Byte accounting for one unit's scratch.
#[derive(Debug, Clone, Copy)]
struct GradLayout {
    grad: usize,
    index: usize,
    block: usize,
    sort: SortScratch,
}

impl GradLayout {
    fn grad_align(&self) -> usize {
        (self.block / self.grad).max(1)
    }

    fn index_align(&self) -> usize {
        (self.block / self.index).max(1)
    }

    /// Grad tile and f32 accumulator, `s` rows of `a` columns.
    fn data_bytes(&self, a: usize, s: usize) -> usize {
        s * a.align_up(self.grad_align()) * self.grad + s * a.align_up(self.block / 4) * 4
    }

    /// Index buffers, sort padding and sort scratch.
    fn index_bytes(&self, s: usize) -> usize {
        let s_align = s.align_up(self.index_align());
        INDEX_BUFFERS * s_align * self.index + 2 * SORT_PADDING + self.sort.bytes(s_align)
    }

    fn occupancy(&self, a: usize, s: usize) -> usize {
        self.data_bytes(a, s) + self.index_bytes(s)
    }

    fn freq_occupancy(&self, a: usize, w: usize) -> usize {
        2 * w * a.align_up(self.grad_align()) * 4 + w.align_up(self.index_align()) * self.index
    }

    fn cast_occupancy(&self, a: usize, w: usize) -> usize {
        w * a.align_up(self.grad_align()) * (4 + self.grad)
    }
}

/// Tile over embedding columns `a` and weight rows `w`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WeightTile {
    a: usize,
    w: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmbeddingGradParams {
    pub num_weights: u64,
    pub padding_idx: i64,
    pub scale_grad_by_freq: u32,
    pub full_load: u32,
    pub embedding_dim: u64,
    pub indices_factor: u64,
    pub grad_factor: u64,
    pub loop_per_core_indice: u64,
    pub loop_per_core_grad: u64,
    pub loop_per_core_indice_freq: u64,
    pub loop_per_core_grad_freq: u64,
    pub embedding_dim_per_core: u64,
    pub embedding_dim_last_core: u64,
    pub grad_factor_per_row: u64,
    pub grad_factor_per_row_tail: u64,
    pub indices_factor_tail: u64,
    pub indices_factor_freq: u64,
    pub indices_factor_freq_tail: u64,
    pub grad_factor_per_row_freq: u64,
    pub grad_factor_per_row_tail_freq: u64,
    pub sort_shared_buf_size: u64,
    pub base_a_cast: u64,
    pub base_w_cast: u64,
    pub cnt_a_cast: u64,
    pub cnt_w_cast: u64,
    pub tail_a_cast: u64,
    pub tail_w_cast: u64,
    pub process_block: u64,
    pub clear_block: u64,
}

impl EmbeddingGradParams {
    /// Units to launch: the accumulate and the clear phase run in the same launch.
    pub fn launch_units(&self) -> u64 {
        self.process_block.max(self.clear_block).max(1)
    }
}

impl ParamBlock for EmbeddingGradParams {
    const LEN: usize = 8 + 8 + 4 + 4 + 25 * 8;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.num_weights)?;
        w.write_i64::<LittleEndian>(self.padding_idx)?;
        w.write_u32::<LittleEndian>(self.scale_grad_by_freq)?;
        w.write_u32::<LittleEndian>(self.full_load)?;
        for v in [
            self.embedding_dim,
            self.indices_factor,
            self.grad_factor,
            self.loop_per_core_indice,
            self.loop_per_core_grad,
            self.loop_per_core_indice_freq,
            self.loop_per_core_grad_freq,
            self.embedding_dim_per_core,
            self.embedding_dim_last_core,
            self.grad_factor_per_row,
            self.grad_factor_per_row_tail,
            self.indices_factor_tail,
            self.indices_factor_freq,
            self.indices_factor_freq_tail,
            self.grad_factor_per_row_freq,
            self.grad_factor_per_row_tail_freq,
            self.sort_shared_buf_size,
            self.base_a_cast,
            self.base_w_cast,
            self.cnt_a_cast,
            self.cnt_w_cast,
            self.tail_a_cast,
            self.tail_w_cast,
            self.process_block,
            self.clear_block,
        ] {
            w.write_u64::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

/// # EmbeddingGradTiling
///
/// Scatter-add of `grad[.., E]` rows into a `[num_weights, E]` table, indexed by `indices`.
/// Units split the embedding dim; each unit walks every index for its columns.
///
/// Short index lists are loaded whole. Longer ones go through a cut cascade that shrinks the
/// index tile `S` and then the column tile `A` until one unit's scratch fits.
#[derive(Debug, Clone)]
pub struct EmbeddingGradTiling {
    grad: Operand,
    indices: Operand,
    mode: EmbeddingGradMode,
}

impl EmbeddingGradTiling {
    pub fn from_workload(
        mode: EmbeddingGradMode,
        workload: &WorkloadDescriptor,
    ) -> Result<Self, TilingError> {
        Enforcer::check_arity(&workload.operands, 2..=2)?;
        Ok(Self {
            grad: workload.operands[0].clone(),
            indices: workload.operands[1].clone(),
            mode,
        })
    }

    fn keys(&self) -> Result<(GradKey, IndexKey), TilingError> {
        let grad = VariantSelector::grad(self.name(), self.grad.dtype)?;
        let index = VariantSelector::index(self.name(), self.indices.dtype)?;
        Ok((grad, index))
    }

    fn no_fit(&self, capacity: &CapacityModel) -> InfeasibleError {
        InfeasibleError::NoFit {
            op: self.name(),
            budget: capacity.scratch_budget,
        }
    }

    /// Main accumulate tile, `(A, S)`.
    fn base_cascade(
        &self,
        layout: &GradLayout,
        per_core: usize,
        min_a: usize,
        numel: usize,
        ub: usize,
    ) -> Result<(usize, usize), TilingError> {
        let full = aligned_columns(per_core, layout.grad_align());
        if layout.occupancy(full, numel) < ub {
            return Ok((full, numel));
        }
        for (a, rows) in [(full, PROCESS_GROUP), (min_a, 1), (NARROW_BASE_A, 1)] {
            if layout.occupancy(a, rows) < ub {
                let s = BufferSizer::largest_fitting(1, numel, |s| layout.occupancy(a, s) <= ub)?;
                log::debug!("{} cut index tile to {s} at {a} columns", self.name());
                return Ok((a, s));
            }
        }
        Err(InfeasibleError::NoFit {
            op: self.name(),
            budget: ub,
        }
        .into())
    }

    /// Tile for the frequency and cast passes over the weight table.
    fn weight_cascade<F>(
        per_core: usize,
        min_a: usize,
        num_weights: usize,
        ub: usize,
        occupancy: F,
    ) -> Result<WeightTile, InfeasibleError>
    where
        F: Fn(usize, usize) -> usize,
    {
        if occupancy(per_core, num_weights) < ub {
            return Ok(WeightTile {
                a: per_core,
                w: num_weights,
            });
        }
        if occupancy(per_core, 1) < ub {
            let w = BufferSizer::largest_fitting(1, num_weights, |w| occupancy(per_core, w) <= ub)?;
            return Ok(WeightTile { a: per_core, w });
        }
        if occupancy(min_a, 1) < ub {
            let hi = per_core.max(min_a);
            let a = BufferSizer::largest_fitting(min_a, hi, |a| occupancy(a, 1) <= ub)?;
            return Ok(WeightTile { a, w: 1 });
        }
        Err(InfeasibleError::ShrinkExhausted { start: num_weights })
    }

    fn empty_plan(&self, grad: GradKey, index: IndexKey) -> TilingDescriptor {
        TilingDescriptor {
            op: self.name(),
            variant: VariantKey::EmbeddingDenseGrad(EmbeddingGradKey::Sorted { index, grad }),
            partition: PartitionSection::Even(PartitionPlanner::ceil_block(0, 1, 1)),
            buffer: BufferPlan::default(),
            workspace: SYSTEM_WORKSPACE,
            params: OpParams::EmbeddingDenseGrad(EmbeddingGradParams {
                num_weights: self.mode.num_weights as u64,
                padding_idx: self.mode.padding_idx,
                scale_grad_by_freq: self.mode.scale_grad_by_freq as u32,
                ..Default::default()
            }),
        }
    }
}

impl OpGuards for EmbeddingGradTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        Enforcer::assert_rank_range(&self.grad, 1..=8)?;
        let (rows, indices) = (self.grad.shape.front_numel(), self.indices.numel());
        if rows != indices {
            return Err(InvariantError::ShapeMismatch {
                left: 0,
                right: 1,
                a: rows,
                b: indices,
            }
            .into());
        }
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        self.keys().map(|_| ())
    }
}

impl OpTiling for EmbeddingGradTiling {
    fn name(&self) -> &'static str {
        "embedding_dense_grad"
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let (grad_key, index_key) = self.keys()?;
        let dim = self.grad.shape.last_dim();
        if dim == 0 {
            return Ok(self.empty_plan(grad_key, index_key));
        }

        let ub = capacity.scratch_budget;
        let layout = GradLayout {
            grad: self.grad.width(),
            index: index_key.width(),
            block: capacity.alignment,
            sort: SortScratch::for_index(index_key),
        };
        let num_weights = self.mode.num_weights;
        let freq = self.mode.scale_grad_by_freq;
        let numel = self.indices.numel().max(1);
        let min_a = CACHE_LINE_BYTES / layout.grad;

        let mut partition = PartitionPlanner::ceil_block(dim, capacity.unit_count, min_a);
        let clear_total = (num_weights * dim).ceil_div(CLEAR_BLOCK_BYTES / layout.grad);
        let clear_per_unit = clear_total.ceil_div(capacity.unit_count);
        let clear_block = clear_total.ceil_div(clear_per_unit);

        let mut params = EmbeddingGradParams {
            num_weights: num_weights as u64,
            padding_idx: self.mode.padding_idx,
            scale_grad_by_freq: freq as u32,
            embedding_dim: dim as u64,
            clear_block: clear_block as u64,
            ..Default::default()
        };

        let full_load = (numel <= FULL_LOAD_INDICES)
            .then(|| {
                let fixed = layout.index_bytes(numel);
                let per_row = ub.checked_sub(fixed)? / (2 * layout.grad) / numel;
                let a = per_row.align_down(layout.grad_align());
                (a >= min_a || a == dim).then_some(a).filter(|a| *a > 0)
            })
            .flatten();

        let (variant, buffer, workspace) = if let Some(a) = full_load {
            partition = PartitionPlanner::ceil_block(dim, partition.units_used, 1);
            let per_core = partition.body_len;
            let (loops, tail) = loop_tail(per_core, a);
            params.full_load = 1;
            params.indices_factor = numel as u64;
            params.grad_factor = (numel * a.align_up(layout.grad_align())) as u64;
            params.loop_per_core_indice = 1;
            params.loop_per_core_grad = loops as u64;
            params.grad_factor_per_row = a as u64;
            params.grad_factor_per_row_tail = tail as u64;
            params.sort_shared_buf_size =
                layout.sort.bytes(numel.align_up(layout.index_align())) as u64;

            let tile_bytes = numel * a * 2 * layout.grad;
            let buffer = BufferPlan::new(
                a,
                tile_bytes,
                numel,
                false,
                1,
                layout.index_bytes(numel),
            );
            let variant = EmbeddingGradKey::FullLoad {
                grad: grad_key,
                scale_by_freq: freq,
            };
            (variant, buffer, SYSTEM_WORKSPACE)
        } else {
            let per_core = partition.body_len;
            let (a, s) = self.base_cascade(&layout, per_core, min_a, numel, ub)?;
            let (grad_loops, grad_tail) = loop_tail(per_core, a);
            let (index_loops, index_tail) = loop_tail(numel, s);
            params.indices_factor = s as u64;
            params.indices_factor_tail = index_tail as u64;
            params.grad_factor = (s * a.align_up(layout.grad_align())) as u64;
            params.loop_per_core_indice = index_loops as u64;
            params.loop_per_core_grad = grad_loops as u64;
            params.grad_factor_per_row = a as u64;
            params.grad_factor_per_row_tail = grad_tail as u64;
            params.sort_shared_buf_size = layout.sort.bytes(s.align_up(layout.index_align())) as u64;

            if freq {
                let tile = Self::weight_cascade(per_core, min_a, num_weights, ub, |a, w| {
                    layout.freq_occupancy(a, w)
                })
                .map_err(|_| self.no_fit(capacity))?;
                let (grad_loops, grad_tail) = loop_tail(per_core, tile.a);
                let (index_loops, index_tail) = loop_tail(num_weights, tile.w);
                params.grad_factor_per_row_freq = tile.a as u64;
                params.loop_per_core_grad_freq = grad_loops as u64;
                params.grad_factor_per_row_tail_freq = grad_tail as u64;
                params.indices_factor_freq = tile.w as u64;
                params.loop_per_core_indice_freq = index_loops as u64;
                params.indices_factor_freq_tail = index_tail as u64;
            } else if grad_key != GradKey::F32 {
                let tile = Self::weight_cascade(per_core, min_a, num_weights, ub, |a, w| {
                    layout.cast_occupancy(a, w)
                })
                .map_err(|_| self.no_fit(capacity))?;
                let (cnt_a, tail_a) = loop_tail(per_core, tile.a);
                let (cnt_w, tail_w) = loop_tail(num_weights, tile.w);
                params.base_a_cast = tile.a as u64;
                params.base_w_cast = tile.w as u64;
                params.cnt_a_cast = cnt_a as u64;
                params.cnt_w_cast = cnt_w as u64;
                params.tail_a_cast = tail_a as u64;
                params.tail_w_cast = tail_w as u64;
            }

            let buffer = BufferPlan::new(
                a,
                layout.data_bytes(a, s),
                s,
                false,
                1,
                layout.index_bytes(s),
            );
            let workspace = WorkspaceSizer::size(
                &WorkspacePolicy::spilling(
                    SYSTEM_WORKSPACE + num_weights * layout.index,
                    SpillRule::new(4, 0),
                ),
                num_weights * dim,
                partition.units_used,
            );
            let variant = EmbeddingGradKey::Sorted {
                index: index_key,
                grad: grad_key,
            };
            (variant, buffer, workspace)
        };

        params.embedding_dim_per_core = partition.body_len as u64;
        params.embedding_dim_last_core = partition.last_len as u64;
        params.process_block = partition.units_used as u64;
        log::debug!(
            "{} dim={dim} indices={numel} -> {variant:?}, launch {} units",
            self.name(),
            params.launch_units()
        );
        Ok(TilingDescriptor {
            op: self.name(),
            variant: VariantKey::EmbeddingDenseGrad(variant),
            partition: PartitionSection::Even(partition),
            buffer,
            workspace,
            params: OpParams::EmbeddingDenseGrad(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, shape, DType, OperatorKind, VariantError};
    use test_strategy::{proptest, Arbitrary};

    fn tiling(
        grad: Operand,
        indices: Operand,
        num_weights: usize,
        freq: bool,
    ) -> EmbeddingGradTiling {
        let mode = EmbeddingGradMode::new(num_weights, -1, freq);
        let workload = WorkloadDescriptor::new(
            rvec![grad, indices],
            OperatorKind::EmbeddingDenseGrad(mode),
        );
        EmbeddingGradTiling::from_workload(mode, &workload).unwrap()
    }

    fn params(desc: &TilingDescriptor) -> EmbeddingGradParams {
        match desc.params {
            OpParams::EmbeddingDenseGrad(p) => p,
            _ => panic!("expected embedding grad params"),
        }
    }

    fn regbase() -> CapacityModel {
        CapacityModel::new(64, 253_952, 32, false)
    }

    #[test]
    fn short_index_list_loads_whole() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let t = tiling(
            Operand::new(shape![128, 512], DType::F32),
            Operand::new(shape![128], DType::I32),
            1000,
            false,
        );
        let desc = t.plan(&regbase())?;
        let p = params(&desc);
        assert_eq!(desc.variant.code(), 104);
        assert_eq!(desc.workspace, SYSTEM_WORKSPACE);
        assert_eq!(p.grad_factor_per_row, 240);
        assert_eq!(p.grad_factor, 128 * 240);
        assert_eq!((p.loop_per_core_grad, p.grad_factor_per_row_tail), (1, 32));
        assert_eq!(desc.units_used(), 16);
        assert_eq!(p.clear_block, 63);
        assert_eq!(p.launch_units(), 63);
        assert!(desc.buffer.fits(&regbase()));
        Ok(())
    }

    #[test]
    fn long_index_list_cuts_and_casts() -> anyhow::Result<()> {
        let t = tiling(
            Operand::new(shape![4096, 256], DType::BF16),
            Operand::new(shape![64, 64], DType::I64),
            50_000,
            false,
        );
        let desc = t.plan(&regbase())?;
        let p = params(&desc);
        assert_eq!(desc.variant.code(), 801);
        // 448 bytes per aligned index, the last one landing exactly on the budget
        assert_eq!(p.indices_factor, 565);
        assert_eq!(p.grad_factor, 565 * 64);
        assert_eq!((p.loop_per_core_indice, p.indices_factor_tail), (8, 141));
        assert_eq!(p.sort_shared_buf_size, 512 + 568 * 24);
        assert_eq!((p.base_a_cast, p.base_w_cast), (64, 661));
        assert_eq!((p.cnt_w_cast, p.tail_w_cast), (76, 425));
        assert_eq!(desc.units_used(), 4);
        assert_eq!(p.clear_block, 64);
        assert_eq!(
            desc.workspace,
            SYSTEM_WORKSPACE + 50_000 * 8 + 50_000 * 256 * 4
        );
        assert_eq!(desc.buffer.occupancy(), 253_952);
        Ok(())
    }

    #[test]
    fn frequency_pass_cuts_weights() -> anyhow::Result<()> {
        let t = tiling(
            Operand::new(shape![2048, 64], DType::F32),
            Operand::new(shape![2048], DType::I32),
            100_000,
            true,
        );
        let desc = t.plan(&regbase())?;
        let p = params(&desc);
        assert_eq!(desc.variant.code(), 404);
        assert_eq!(p.indices_factor, 866);
        assert_eq!(p.indices_factor_freq, 976);
        assert_eq!((p.loop_per_core_indice_freq, p.indices_factor_freq_tail), (103, 448));
        assert_eq!(p.grad_factor_per_row_freq, 32);
        assert_eq!(p.base_w_cast, 0);
        Ok(())
    }

    #[test]
    fn sorted_column_tile_is_block_aligned() -> anyhow::Result<()> {
        let t = tiling(
            Operand::new(shape![2048, 100], DType::F32),
            Operand::new(shape![2048], DType::I32),
            100,
            false,
        );
        let single = CapacityModel::new(1, 253_952, 32, false);
        let desc = t.plan(&single)?;
        let p = params(&desc);
        assert_eq!(p.embedding_dim_per_core, 100);
        assert_eq!(p.grad_factor_per_row, 96);
        assert_eq!((p.loop_per_core_grad, p.grad_factor_per_row_tail), (2, 4));
        assert_eq!(desc.buffer.inner_tile, 96);
        assert!(desc.buffer.fits(&single));

        assert_eq!(aligned_columns(100, 8), 96);
        assert_eq!(aligned_columns(5, 8), 5);
        Ok(())
    }

    #[test]
    fn nothing_fits_a_tiny_budget() {
        let t = tiling(
            Operand::new(shape![2048, 64], DType::F32),
            Operand::new(shape![2048], DType::I32),
            100,
            false,
        );
        assert!(matches!(
            t.plan(&CapacityModel::new(8, 900, 32, false)),
            Err(TilingError::Infeasible(InfeasibleError::NoFit { .. }))
        ));
    }

    #[test]
    fn invalid_workloads() {
        let rows = tiling(
            Operand::new(shape![16, 64], DType::F32),
            Operand::new(shape![15], DType::I32),
            10,
            false,
        );
        assert!(matches!(
            rows.plan(&regbase()),
            Err(TilingError::Invariant(InvariantError::ShapeMismatch { a: 16, b: 15, .. }))
        ));

        let index = tiling(
            Operand::new(shape![16, 64], DType::F32),
            Operand::new(shape![16], DType::I8),
            10,
            false,
        );
        assert!(matches!(
            index.plan(&regbase()),
            Err(TilingError::Variant(VariantError::UnsupportedDType { dtype: DType::I8, .. }))
        ));
    }

    #[test]
    fn empty_embedding() -> anyhow::Result<()> {
        let t = tiling(
            Operand::new(shape![16, 0], DType::F16),
            Operand::new(shape![16], DType::I64),
            10,
            false,
        );
        let desc = t.plan(&regbase())?;
        assert_eq!(desc.units_used(), 1);
        assert_eq!(desc.variant.code(), 802);
        Ok(())
    }

    #[derive(Arbitrary, Debug)]
    struct GradProblem {
        #[strategy(1..=8192usize)]
        indices: usize,
        #[strategy(1..=4096usize)]
        dim: usize,
        #[strategy(1..=200_000usize)]
        num_weights: usize,
        #[strategy(proptest::sample::select(vec![DType::F16, DType::BF16, DType::F32]))]
        grad: DType,
        #[strategy(proptest::sample::select(vec![DType::I32, DType::I64]))]
        index: DType,
        freq: bool,
    }

    #[proptest(cases = 256)]
    fn columns_covered_and_scratch_fits(prob: GradProblem) {
        let t = tiling(
            Operand::new(shape![prob.indices, prob.dim], prob.grad),
            Operand::new(shape![prob.indices], prob.index),
            prob.num_weights,
            prob.freq,
        );
        let capacity = regbase();
        let desc = t.plan(&capacity).unwrap();
        assert!(desc.buffer.fits(&capacity));
        let PartitionSection::Even(plan) = &desc.partition else {
            panic!("embedding grad plans are even");
        };
        assert!(plan.units_used <= capacity.unit_count);
        assert_eq!(plan.ranges().last().map(|r| r.end), Some(prob.dim));
    }
}
