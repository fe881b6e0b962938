use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    Align, BufferPlan, BufferRequest, BufferSizer, CapacityModel, DType, DTypeClass, Enforcer,
    InfeasibleError, OpGuards,
    OpParams, OpTiling, Operand, ParamBlock, PartitionPlan, PartitionPlanner, PartitionSection,
    RmsNormMode, RmsNormTemplate, ShrinkStep, TilingDescriptor, TilingError, VariantError,
    VariantKey, WorkloadDescriptor, WorkspacePolicy, WorkspaceSizer, RESERVED_UB,
    SYSTEM_WORKSPACE,
};

/// Rows reduced per pass, one f32 repeat.
pub const ROW_FACTOR: usize = 64;
const SPLIT_ALIGN: usize = 16;
const SMALL_REDUCE_COLS: usize = 2000;
const MERGE_ROW_OVERHEAD: usize = 260;
const USER_WORKSPACE: usize = 256;
/// f32 rstd and reduction slots, one per row of a pass.
const ROW_SCRATCH: usize = 2 * ROW_FACTOR * 4;

/// Column budget in elements for one row pass.
fn column_factor(dtype: DType, gemma: bool) -> usize {
    match (dtype, gemma) {
        (DType::F32, false) => 10240,
        (_, false) => 12288,
        (DType::F32, true) => 8192,
        (_, true) => 10240,
    }
}

/// Column-sized buffers of one pass, counted in input-width regions: x, gamma and y, plus the
/// f32 squares and, for 16-bit inputs, the f32 copy of x.
fn column_regions(dtype: DType) -> usize {
    match dtype.class() {
        DTypeClass::Half16 => 3 + 4,
        _ => 3 + 1,
    }
}

/// `(loops, tail)` to walk `len` rows `factor` at a time.
fn row_loop(len: usize, factor: usize) -> (usize, usize) {
    if len == 0 || factor == 0 {
        return (0, 0);
    }
    let loops = len.ceil_div(factor);
    (loops, len - (loops - 1) * factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RmsNormParams {
    pub num_row: u64,
    pub num_col: u64,
    pub num_col_align: u64,
    pub block_factor: u64,
    pub last_block_factor: u64,
    pub row_factor: u64,
    pub ub_factor: u64,
    pub row_loop: u64,
    pub last_block_row_loop: u64,
    pub row_tail: u64,
    pub last_block_row_tail: u64,
    pub mode: u32,
    pub mul_loop: u32,
    pub mul_tail: u32,
    pub dst_rep_stride: u32,
    pub is_performance: u32,
    pub is_gemma: u32,
    pub epsilon: f32,
    pub avg_factor: f32,
}

impl ParamBlock for RmsNormParams {
    const LEN: usize = 11 * 8 + 6 * 4 + 2 * 4;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for v in [
            self.num_row,
            self.num_col,
            self.num_col_align,
            self.block_factor,
            self.last_block_factor,
            self.row_factor,
            self.ub_factor,
            self.row_loop,
            self.last_block_row_loop,
            self.row_tail,
            self.last_block_row_tail,
        ] {
            w.write_u64::<LittleEndian>(v)?;
        }
        for v in [
            self.mode,
            self.mul_loop,
            self.mul_tail,
            self.dst_rep_stride,
            self.is_performance,
            self.is_gemma,
        ] {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_f32::<LittleEndian>(self.epsilon)?;
        w.write_f32::<LittleEndian>(self.avg_factor)
    }
}

/// Chosen code path with its row and column factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowSplit {
    template: RmsNormTemplate,
    row_factor: usize,
    ub_factor: usize,
    /// Regions of `ub_factor` input-width elements reported in the buffer plan.
    regions: usize,
    /// Scratch bytes the pass occupies below the reserved area.
    scratch: usize,
}

/// # RmsNormTiling
///
/// Row-parallel RMS normalization. `x` is `[rows.., cols..]`, `gamma` covers the trailing
/// dims of `x`; each unit owns a contiguous block of rows.
#[derive(Debug, Clone)]
pub struct RmsNormTiling {
    x: Operand,
    gamma: Operand,
    mode: RmsNormMode,
}

impl RmsNormTiling {
    pub fn from_workload(
        mode: RmsNormMode,
        workload: &WorkloadDescriptor,
    ) -> Result<Self, TilingError> {
        Enforcer::check_arity(&workload.operands, 2..=2)?;
        Ok(Self {
            x: workload.operands[0].clone(),
            gamma: workload.operands[1].clone(),
            mode,
        })
    }

    fn cols(&self) -> usize {
        self.gamma.numel()
    }

    fn rows(&self) -> usize {
        self.x.shape.leading_numel(self.gamma.shape.rank())
    }

    /// x in a 16-bit type normalised by an f32 gamma.
    fn is_mixed(&self) -> bool {
        self.x.dtype != self.gamma.dtype && self.gamma.dtype == DType::F32
    }

    fn is_performance(&self, capacity: &CapacityModel) -> bool {
        let shape = &self.x.shape;
        let dims_ok = match shape.rank() {
            2 => shape[0] <= 512,
            3 => shape[0] <= 512 && shape[1] <= 8,
            _ => false,
        };
        dims_ok
            && self.gamma.shape.rank() == 1
            && self.cols() <= 5120
            && matches!(self.x.dtype, DType::F16 | DType::BF16)
            && !self.is_mixed()
            && capacity.merged_rows
            && !self.mode.gemma
    }

    /// Largest multiple of 16 not above the even split that leaves no sub-block column tail.
    fn split_columns(cols: usize, factor: usize) -> Result<usize, InfeasibleError> {
        let col_tiles = cols.ceil_div(factor);
        let start = cols.ceil_div(col_tiles * SPLIT_ALIGN) * SPLIT_ALIGN;
        BufferSizer::shrink(start, ShrinkStep::Decrement(SPLIT_ALIGN), |ub| {
            cols % ub == 0 || cols % ub >= SPLIT_ALIGN
        })
    }

    fn select(
        &self,
        ub: usize,
        cols: usize,
        col_align: usize,
        capacity: &CapacityModel,
    ) -> Result<RowSplit, TilingError> {
        if self.is_mixed() && !self.mode.gemma {
            return self.select_mixed(ub, col_align, capacity);
        }
        if !self.mode.gemma && col_align <= SMALL_REDUCE_COLS && capacity.merged_rows {
            let per_row = col_align * SPLIT_ALIGN + MERGE_ROW_OVERHEAD;
            let row_factor = ub / per_row;
            return Ok(RowSplit {
                template: RmsNormTemplate::MergeN,
                row_factor,
                ub_factor: row_factor * col_align,
                regions: 1,
                scratch: row_factor * per_row,
            });
        }

        let regions = column_regions(self.x.dtype);
        let request = BufferRequest::new(self.x.dtype.size_of(), regions, false)
            .with_reserve(RESERVED_UB + ROW_SCRATCH, false);
        let fitted = BufferSizer::closed_form(&request, capacity)?.inner_tile;
        let factor =
            column_factor(self.x.dtype, self.mode.gemma).min(fitted.align_down(SPLIT_ALIGN));
        if factor == 0 {
            return Err(InfeasibleError::BelowBlock {
                bytes: fitted * self.x.dtype.size_of(),
                align: SPLIT_ALIGN * self.x.dtype.size_of(),
            }
            .into());
        }
        let (template, ub_factor) = if col_align > factor {
            (RmsNormTemplate::SplitD, Self::split_columns(cols, factor)?)
        } else {
            (RmsNormTemplate::Normal, factor)
        };
        Ok(RowSplit {
            template,
            row_factor: ROW_FACTOR,
            ub_factor,
            regions,
            scratch: ub_factor * self.x.dtype.size_of() * regions + ROW_SCRATCH,
        })
    }

    fn select_mixed(
        &self,
        ub: usize,
        col_align: usize,
        capacity: &CapacityModel,
    ) -> Result<RowSplit, TilingError> {
        let xy_gamma = 2 * 2 * col_align + 4 * col_align;
        let rstd = 4 * 8;
        let tmp = 4 * 2 * col_align;
        let reduce = 4 * ROW_FACTOR;
        let multi_rstd = 4 * ROW_FACTOR;

        if col_align <= SMALL_REDUCE_COLS && capacity.merged_rows {
            let per_row = xy_gamma + tmp + rstd + reduce;
            let row_factor = ub / per_row;
            return Ok(RowSplit {
                template: RmsNormTemplate::MergeN,
                row_factor,
                ub_factor: row_factor * col_align,
                regions: 1,
                scratch: row_factor * per_row,
            });
        }
        let normal = RowSplit {
            template: RmsNormTemplate::Normal,
            row_factor: ROW_FACTOR,
            ub_factor: col_align,
            regions: 1,
            scratch: xy_gamma + tmp + multi_rstd + reduce,
        };
        if normal.scratch < ub {
            return Ok(normal);
        }
        let single = RowSplit {
            template: RmsNormTemplate::SingleRow,
            scratch: 2 * col_align + 4 * col_align + tmp + multi_rstd + reduce,
            ..normal
        };
        if single.scratch < ub {
            return Ok(single);
        }

        let one_col = 2 * 2 + 4 * 3;
        let not_col = multi_rstd + reduce + 4 * 8 * ROW_FACTOR;
        let tmp_col = ub
            .checked_sub(not_col)
            .filter(|rest| *rest > 0)
            .map(|rest| (rest / one_col).align_down(SPLIT_ALIGN))
            .ok_or(InfeasibleError::NoFit {
                op: self.name(),
                budget: capacity.scratch_budget,
            })?;
        Ok(RowSplit {
            template: RmsNormTemplate::SplitD,
            row_factor: ROW_FACTOR,
            ub_factor: tmp_col,
            regions: 1,
            scratch: tmp_col * one_col + not_col,
        })
    }

    fn empty_plan(&self, capacity: &CapacityModel) -> TilingDescriptor {
        TilingDescriptor {
            op: self.name(),
            variant: VariantKey::RmsNorm(RmsNormTemplate::Normal),
            partition: PartitionSection::Even(PartitionPlanner::ceil_block(
                0,
                capacity.unit_count,
                1,
            )),
            buffer: BufferPlan::new(0, 0, 0, false, 1, RESERVED_UB),
            workspace: self.workspace(),
            params: OpParams::RmsNorm(RmsNormParams {
                is_gemma: self.mode.gemma as u32,
                epsilon: self.mode.epsilon,
                ..Default::default()
            }),
        }
    }

    fn workspace(&self) -> usize {
        WorkspaceSizer::size(
            &WorkspacePolicy::fixed(USER_WORKSPACE + SYSTEM_WORKSPACE),
            0,
            0,
        )
    }
}

impl OpGuards for RmsNormTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        Enforcer::assert_rank_range(&self.x, 1..=8)?;
        Enforcer::assert_rank_range(&self.gamma, 1..=8)?;
        Enforcer::check_trailing_dims(&self.x, &self.gamma)?;
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        let (x, gamma) = (self.x.dtype, self.gamma.dtype);
        if !matches!(x, DType::F16 | DType::BF16 | DType::F32) {
            return Err(VariantError::UnsupportedDType {
                op: self.name(),
                dtype: x,
            }
            .into());
        }
        if x != gamma && gamma != DType::F32 {
            return Err(VariantError::UnsupportedCombination {
                op: self.name(),
                reason: format!("x {x} with gamma {gamma}"),
            }
            .into());
        }
        Ok(())
    }
}

impl OpTiling for RmsNormTiling {
    fn name(&self) -> &'static str {
        if self.mode.gemma {
            "gemma_rms_norm"
        } else {
            "rms_norm"
        }
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let (rows, cols) = (self.rows(), self.cols());
        if rows == 0 || cols == 0 {
            return Ok(self.empty_plan(capacity));
        }

        let ub = capacity
            .scratch_budget
            .checked_sub(RESERVED_UB)
            .ok_or(InfeasibleError::Reserve {
                budget: capacity.scratch_budget,
                reserved: RESERVED_UB,
            })?;
        let per_block = self.x.dtype.elements_per_block(capacity.alignment);
        let col_align = cols.align_up(per_block);

        let partition: PartitionPlan = PartitionPlanner::ceil_block(rows, capacity.unit_count, 1);
        let split = self.select(ub, cols, col_align, capacity)?;
        let width = self.x.dtype.size_of();
        let tile_bytes = split.ub_factor * width;
        if split.row_factor == 0 || split.ub_factor == 0 || split.scratch > ub {
            return Err(InfeasibleError::NoFit {
                op: self.name(),
                budget: capacity.scratch_budget,
            }
            .into());
        }

        let block_factor = partition.body_len;
        let last_block_factor = partition.last_len;
        let (rows_loop, rows_tail) = row_loop(block_factor, split.row_factor);
        let (last_row_loop, last_row_tail) = row_loop(last_block_factor, split.row_factor);

        let params = RmsNormParams {
            num_row: rows as u64,
            num_col: cols as u64,
            num_col_align: col_align as u64,
            block_factor: block_factor as u64,
            last_block_factor: last_block_factor as u64,
            row_factor: split.row_factor as u64,
            ub_factor: split.ub_factor as u64,
            row_loop: rows_loop as u64,
            last_block_row_loop: last_row_loop as u64,
            row_tail: rows_tail as u64,
            last_block_row_tail: last_row_tail as u64,
            mode: split.template.code() as u32,
            mul_loop: (col_align / 64) as u32,
            mul_tail: (col_align % 64) as u32,
            dst_rep_stride: (col_align / 8) as u32,
            is_performance: self.is_performance(capacity) as u32,
            is_gemma: self.mode.gemma as u32,
            epsilon: self.mode.epsilon,
            avg_factor: 1.0 / cols as f32,
        };
        let buffer = BufferPlan {
            inner_tile: split.ub_factor,
            tile_bytes,
            tile_rows: split.row_factor,
            double_buffered: false,
            regions: split.regions,
            extra_reserved: RESERVED_UB + split.scratch.saturating_sub(tile_bytes * split.regions),
        };
        log::debug!(
            "{} rows={rows} cols={cols} -> {:?} over {} units",
            self.name(),
            split.template,
            partition.units_used
        );
        Ok(TilingDescriptor {
            op: self.name(),
            variant: VariantKey::RmsNorm(split.template),
            partition: PartitionSection::Even(partition),
            buffer,
            workspace: self.workspace(),
            params: OpParams::RmsNorm(params),
        })
    }
}
