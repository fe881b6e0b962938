use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    loop_tail, Align, AvgPool3dKey, AvgPool3dMode, BufferPlan, BufferRequest, BufferSizer,
    CapacityModel, Enforcer, InfeasibleError, OpGuards, OpParams, OpTiling, Operand, ParamBlock,
    PartitionPlan, PartitionPlanner, PartitionSection, PoolDType, PoolFormat, PoolTemplate,
    TilingDescriptor, TilingError, VariantError, VariantKey, VariantSelector, WorkloadDescriptor,
    BLOCK_BYTES, SYSTEM_WORKSPACE,
};

const POOL_RESERVED_UB: usize = 10 * 1024;
const INDEX_BUFFERS: usize = 9;
const INDEX_BUF_BYTES: usize = 9 * 1024;
/// Window offsets one index buffer holds.
pub const INDEX_BUF_LEN: usize = INDEX_BUF_BYTES / INDEX_BUFFERS / 8;
/// f32 sum and divisor lanes kept beside every staged element.
const ROW_SIDE_BYTES: usize = 8;
/// Longest run of window elements one pass can address.
const MAX_TILE: usize = 4095;
/// Channel rows the normal template folds into one block.
const NC_FACTOR: usize = 64;
const NORMAL_WINDOW_LIMIT: usize = 128;
const NORMAL_KW_LIMIT: usize = 16;
const CORE_SYNC_BYTES: usize = 2048;

/// Output length of one pooled axis, 0 when the window never fits.
///
/// In ceil mode the last window must still start inside the input or its left padding.
pub fn pooled_len(input: usize, kernel: usize, stride: usize, pad: usize, ceil_mode: bool) -> usize {
    let span = input + 2 * pad;
    if span < kernel || stride == 0 {
        return 0;
    }
    let steps = span - kernel;
    if !ceil_mode {
        return steps / stride + 1;
    }
    let out = steps.ceil_div(stride) + 1;
    if (out - 1) * stride >= input + pad {
        out - 1
    } else {
        out
    }
}

/// Largest divisor of `len` no greater than `cap`, 0 when `cap` is 0.
fn largest_divisor(len: usize, cap: usize) -> usize {
    (1..=cap.min(len)).rev().find(|d| len % d == 0).unwrap_or(0)
}

/// One when the final pass of `len` in steps of `tile` is a partial block.
fn short_tail(len: usize, tile: usize, align: usize) -> usize {
    matches!(len.checked_rem(tile), Some(t) if t != 0 && t < align) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvgPool3dParams {
    pub n: u64,
    pub c: u64,
    pub tile_c: u64,
    /// `[d, h, w]`
    pub input: [u64; 3],
    pub output: [u64; 3],
    pub kernel: [u64; 3],
    pub stride: [u64; 3],
    pub pad: [u64; 3],
    pub divisor_override: i64,
    pub count_include_pad: u64,
    pub ceil_mode: u64,
    pub former_len: u64,
    pub former_num: u64,
    pub tail_len: u64,
    pub tail_num: u64,
    pub index_buf_len: u64,
    pub window_w_num: u64,
    pub tile_input: u64,
    pub tile_hw: u64,
    pub atomic_add_num: u64,
    /// `[nc, d, h, w]` blocking of the normal template.
    pub factor: [u64; 4],
    pub outer: [u64; 4],
    pub tail: [u64; 4],
    pub block_factor: u64,
    pub block_tail: u64,
    pub total_idx: u64,
    pub core_num: u64,
}

impl ParamBlock for AvgPool3dParams {
    const LEN: usize = 46 * 8;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let head = [self.n, self.c, self.tile_c];
        let geometry = [self.input, self.output, self.kernel, self.stride, self.pad];
        for v in head.iter().chain(geometry.iter().flatten()) {
            w.write_u64::<LittleEndian>(*v)?;
        }
        w.write_i64::<LittleEndian>(self.divisor_override)?;
        let ub = [
            self.count_include_pad,
            self.ceil_mode,
            self.former_len,
            self.former_num,
            self.tail_len,
            self.tail_num,
            self.index_buf_len,
            self.window_w_num,
            self.tile_input,
            self.tile_hw,
            self.atomic_add_num,
        ];
        let blocking = [self.factor, self.outer, self.tail];
        let block = [self.block_factor, self.block_tail, self.total_idx, self.core_num];
        for v in ub.iter().chain(blocking.iter().flatten()).chain(block.iter()) {
            w.write_u64::<LittleEndian>(*v)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Geometry {
    n: usize,
    c: usize,
    input: [usize; 3],
    output: [usize; 3],
}

/// What one pass keeps in scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PassTiles {
    tile_c: usize,
    tile_input: usize,
    window_w_num: usize,
    tile_hw: usize,
    atomic_add: usize,
    bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NormalSplit {
    factor: [usize; 4],
    outer: [usize; 4],
    tail: [usize; 4],
}

/// # AvgPool3dTiling
///
/// 3D average pooling over a rank 5 `x` in NCDHW or NDHWC layout.
///
/// Output points are dealt out balanced across units. Per pass the planner stages either a
/// channel slice, a slice of one window row, or several windows of a row, whichever is the
/// widest that fits. Channels-first windows small enough to unroll use the normal template,
/// which blocks `[n * c, d, h, w]` until every unit has work.
#[derive(Debug, Clone)]
pub struct AvgPool3dTiling {
    x: Operand,
    mode: AvgPool3dMode,
}

impl AvgPool3dTiling {
    pub fn from_workload(
        mode: AvgPool3dMode,
        workload: &WorkloadDescriptor,
    ) -> Result<Self, TilingError> {
        Enforcer::check_arity(&workload.operands, 1..=1)?;
        Ok(Self {
            x: workload.operands[0].clone(),
            mode,
        })
    }

    fn geometry(&self) -> Geometry {
        let s = &self.x.shape;
        let (n, c, input) = match self.mode.format {
            PoolFormat::Ncdhw => (s[0], s[1], [s[2], s[3], s[4]]),
            PoolFormat::Ndhwc => (s[0], s[4], [s[1], s[2], s[3]]),
        };
        let m = &self.mode;
        let output = [0, 1, 2]
            .map(|a| pooled_len(input[a], m.kernel[a], m.stride[a], m.pad[a], m.ceil_mode));
        Geometry {
            n,
            c,
            input,
            output,
        }
    }

    /// Only the depth axis pools; every `h * w` plane is reduced whole.
    fn depth_only(&self) -> bool {
        let m = &self.mode;
        m.format == PoolFormat::Ncdhw
            && m.kernel[1..] == [1, 1]
            && m.stride[1..] == [1, 1]
    }

    fn normal_fits(&self, ub: usize) -> bool {
        let [kd, kh, kw] = self.mode.kernel;
        let window = kd * kh * kw.align_up(8);
        self.mode.format == PoolFormat::Ncdhw
            && window <= NORMAL_WINDOW_LIMIT
            && kw <= NORMAL_KW_LIMIT
            && NC_FACTOR * (window + 1) * 4 <= ub
    }

    fn points(&self, g: &Geometry) -> usize {
        let [od, oh, ow] = g.output;
        match self.mode.format {
            PoolFormat::Ndhwc => g.n * od * oh * ow,
            PoolFormat::Ncdhw if self.depth_only() => g.n * g.c * od,
            PoolFormat::Ncdhw => g.n * g.c * od * oh * ow,
        }
    }

    fn pass_tiles(
        &self,
        g: &Geometry,
        width: usize,
        ub: usize,
        tile_len: usize,
    ) -> Result<(PoolTemplate, PassTiles), TilingError> {
        let align = 2 * BLOCK_BYTES / width;
        let row = width + ROW_SIDE_BYTES;
        let (kw, sw) = (self.mode.kernel[2], self.mode.stride[2]);

        if self.depth_only() {
            let hw = g.input[1] * g.input[2];
            let tile_hw = hw.align_up(align).min(tile_len);
            let tiles = PassTiles {
                tile_hw,
                atomic_add: short_tail(hw, tile_hw, align),
                bytes: tile_hw * row,
                ..Default::default()
            };
            return Ok((PoolTemplate::ReduceD, tiles));
        }
        if self.normal_fits(ub) {
            let [kd, kh, kw] = self.mode.kernel;
            let tiles = PassTiles {
                bytes: NC_FACTOR * (kd * kh * kw.align_up(8) + 1) * 4,
                ..Default::default()
            };
            return Ok((PoolTemplate::Normal, tiles));
        }

        let align_c = g.c.align_up(align);
        let split_c = |atomic_add: usize| {
            let tile_c = align_c.min(tile_len);
            PassTiles {
                tile_c,
                atomic_add,
                bytes: tile_c * row,
                ..Default::default()
            }
        };
        if 2 * align_c > tile_len {
            let tile_c = align_c.min(tile_len);
            return Ok((PoolTemplate::SplitC, split_c(short_tail(g.c, tile_c, align))));
        }

        // rows narrower than a block overlap their neighbours
        let block = BLOCK_BYTES / width;
        let atomic_add = match g.c {
            c if c < block => (c.align_up(block) - 1).checked_div(c).unwrap_or(0),
            _ => 0,
        };
        let split_w = |tile_input: usize| PassTiles {
            tile_c: align_c,
            tile_input,
            atomic_add,
            bytes: align_c * (4 * tile_input + width + 4),
            ..Default::default()
        };
        let tile_input = ((ub / align_c).saturating_sub(width + 4) / 4).min(MAX_TILE);
        if tile_input == 0 {
            return Err(InfeasibleError::NoFit {
                op: self.name(),
                budget: ub,
            }
            .into());
        }
        if tile_input < kw {
            return Ok((PoolTemplate::SplitW, split_w(tile_input)));
        }
        if sw > kw {
            return Ok((PoolTemplate::SplitW, split_w(kw)));
        }

        let window_bytes = |w: usize| align_c * (4 * kw + w * (4 * (sw + 1) + width));
        let hi = g.output[2].min(MAX_TILE / kw.max(1));
        match BufferSizer::largest_fitting(1, hi, |w| window_bytes(w) <= ub) {
            Ok(window) => Ok((
                PoolTemplate::MultiW,
                PassTiles {
                    tile_c: align_c,
                    tile_input: window,
                    window_w_num: largest_divisor(INDEX_BUF_LEN, window),
                    atomic_add,
                    bytes: window_bytes(window),
                    ..Default::default()
                },
            )),
            Err(_) => Ok((PoolTemplate::SplitC, split_c(atomic_add))),
        }
    }

    /// Blocks `[n * c, d, h, w]`, narrowing each axis in turn until there is a block per unit.
    fn normal_split(&self, g: &Geometry, unit_count: usize) -> (NormalSplit, PartitionPlan) {
        let lens = [g.n * g.c, g.output[0], g.output[1], g.output[2]];
        let mut split = NormalSplit::default();
        let mut blocks = 1;
        for (axis, len) in lens.into_iter().enumerate() {
            let factor = match axis {
                0 => NC_FACTOR,
                _ if blocks < unit_count => (len / unit_count.ceil_div(blocks)).max(1),
                _ => len,
            };
            let (outer, tail) = loop_tail(len, factor);
            split.factor[axis] = factor;
            split.outer[axis] = outer;
            split.tail[axis] = tail;
            blocks *= outer;
        }
        (split, PartitionPlanner::ceil_block(blocks, unit_count, 1))
    }

    fn base_params(&self, g: &Geometry) -> AvgPool3dParams {
        let wide = |a: [usize; 3]| a.map(|v| v as u64);
        AvgPool3dParams {
            n: g.n as u64,
            c: g.c as u64,
            input: wide(g.input),
            output: wide(g.output),
            kernel: wide(self.mode.kernel),
            stride: wide(self.mode.stride),
            pad: wide(self.mode.pad),
            divisor_override: self.mode.divisor_override,
            count_include_pad: self.mode.count_include_pad as u64,
            ceil_mode: self.mode.ceil_mode as u64,
            index_buf_len: INDEX_BUF_LEN as u64,
            ..Default::default()
        }
    }

    fn descriptor(
        &self,
        key: AvgPool3dKey,
        partition: PartitionPlan,
        buffer: BufferPlan,
        workspace: usize,
        params: AvgPool3dParams,
    ) -> TilingDescriptor {
        TilingDescriptor {
            op: self.name(),
            variant: VariantKey::AvgPool3d(key),
            partition: PartitionSection::Even(partition),
            buffer,
            workspace,
            params: OpParams::AvgPool3d(params),
        }
    }
}

impl OpGuards for AvgPool3dTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        Enforcer::assert_rank_range(&self.x, 5..=5)?;
        let m = &self.mode;
        for axis in 0..3 {
            if m.kernel[axis] == 0 || m.stride[axis] == 0 {
                return Err(VariantError::UnsupportedCombination {
                    op: self.name(),
                    reason: format!("zero kernel or stride on axis {axis}"),
                }
                .into());
            }
            if 2 * m.pad[axis] > m.kernel[axis] {
                return Err(VariantError::UnsupportedCombination {
                    op: self.name(),
                    reason: format!(
                        "pad {} exceeds half of kernel {} on axis {axis}",
                        m.pad[axis], m.kernel[axis]
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        VariantSelector::pool(self.name(), self.x.dtype)?;
        Ok(())
    }
}

impl OpTiling for AvgPool3dTiling {
    fn name(&self) -> &'static str {
        "avg_pool3d"
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let dtype: PoolDType = VariantSelector::pool(self.name(), self.x.dtype)?;
        let width = self.x.width();
        let reserved = POOL_RESERVED_UB + INDEX_BUF_BYTES;
        let req = BufferRequest::new(width + ROW_SIDE_BYTES, 1, false).with_reserve(reserved, false);
        let rows = BufferSizer::closed_form(&req, capacity)?;
        let ub = capacity.scratch_budget.saturating_sub(reserved);
        let align = 2 * BLOCK_BYTES / width;
        let tile_len = rows.inner_tile.align_down(align);
        if tile_len == 0 {
            return Err(InfeasibleError::BelowBlock {
                bytes: rows.tile_bytes,
                align: align * (width + ROW_SIDE_BYTES),
            }
            .into());
        }

        let g = self.geometry();
        let mut params = self.base_params(&g);
        let points = self.points(&g);
        if self.x.numel() == 0 || points == 0 {
            let key = AvgPool3dKey {
                template: PoolTemplate::SplitC,
                dtype,
            };
            params.core_num = 1;
            let buffer = BufferPlan {
                regions: 1,
                extra_reserved: reserved,
                ..Default::default()
            };
            let idle = PartitionPlanner::ceil_block(0, 1, 1);
            return Ok(self.descriptor(key, idle, buffer, SYSTEM_WORKSPACE, params));
        }

        let balanced = PartitionPlanner::balanced(points, capacity, 1)?;
        let (template, tiles) = self.pass_tiles(&g, width, ub, tile_len)?;
        let partition = match template {
            PoolTemplate::Normal => {
                let (split, partition) = self.normal_split(&g, capacity.unit_count);
                params.factor = split.factor.map(|v| v as u64);
                params.outer = split.outer.map(|v| v as u64);
                params.tail = split.tail.map(|v| v as u64);
                params.block_factor = partition.body_len as u64;
                params.block_tail = partition.last_len as u64;
                params.total_idx = partition.outer as u64;
                partition
            }
            _ => balanced.clone(),
        };

        let (former_len, former_num, tail_len, tail_num) = match balanced.head_units {
            0 => (balanced.body_len, balanced.units_used, 0, 0),
            head => (
                balanced.head_len,
                head,
                balanced.body_len,
                balanced.units_used - head,
            ),
        };
        params.former_len = former_len as u64;
        params.former_num = former_num as u64;
        params.tail_len = tail_len as u64;
        params.tail_num = tail_num as u64;
        params.tile_c = tiles.tile_c as u64;
        params.tile_input = tiles.tile_input as u64;
        params.window_w_num = tiles.window_w_num as u64;
        params.tile_hw = tiles.tile_hw as u64;
        params.atomic_add_num = tiles.atomic_add as u64;
        params.core_num = partition.units_used as u64;

        let workspace = match tiles.atomic_add {
            0 => SYSTEM_WORKSPACE,
            _ => SYSTEM_WORKSPACE + CORE_SYNC_BYTES,
        };
        let buffer = BufferPlan {
            inner_tile: tile_len,
            tile_bytes: tiles.bytes,
            tile_rows: tiles.window_w_num.max(1),
            double_buffered: false,
            regions: 1,
            extra_reserved: reserved,
        };
        log::debug!(
            "{} {:?} -> {:?}, {template} over {} units",
            self.name(),
            g.input,
            g.output,
            partition.units_used
        );
        let key = AvgPool3dKey { template, dtype };
        Ok(self.descriptor(key, partition, buffer, workspace, params))
    }
}
