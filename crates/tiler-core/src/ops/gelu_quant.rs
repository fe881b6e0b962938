use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    Align, BufferPlan, CapacityModel, DType, Enforcer, GeluQuantKey, GeluQuantMode, GeluTemplate,
    InfeasibleError, InvariantError, OpGuards, OpParams, OpTiling, Operand, ParamBlock,
    PartitionPlan, PartitionPlanner, PartitionSection, QuantMode, RoundMode, SpillRule,
    TilingDescriptor, TilingError, VariantError, VariantKey, VariantSelector, WorkloadDescriptor,
    WorkspacePolicy, WorkspaceSizer, RESERVED_UB, SYSTEM_WORKSPACE,
};

const STATIC_NODES: usize = 11;
const DYNAMIC_NODES: usize = 13;
const F32_BLOCK: usize = 8;
/// Smallest slice worth a unit of its own.
const MIN_UNIT_ELEMENTS: usize = 128;

/// How an optional quantization operand is supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QuantTensorKind {
    #[default]
    Empty,
    Scalar,
    /// One value per element of the end axis.
    Normal,
}

impl QuantTensorKind {
    fn of(operand: Option<&Operand>) -> Self {
        match operand {
            None => QuantTensorKind::Empty,
            Some(op) if op.numel() == 1 => QuantTensorKind::Scalar,
            Some(_) => QuantTensorKind::Normal,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            QuantTensorKind::Empty => 0,
            QuantTensorKind::Scalar => 1,
            QuantTensorKind::Normal => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeluQuantParams {
    pub used_core_num: u64,
    pub normal_core_process_num: u64,
    pub tail_core_process_num: u64,
    pub coexistent_node_num: u64,
    pub coexistent_node_element_num: u64,
    pub row_inner: u64,
    pub row_outer: u64,
    pub row_tail: u64,
    pub col_inner: u64,
    pub col_outer: u64,
    pub col_tail: u64,
    pub end_axis_len: u64,
    pub end_axis_len_aligned: u64,
    pub quant_mode: u32,
    pub approximate: u32,
    pub scale_type: u32,
    pub offset_type: u32,
    pub dst_type: u32,
    pub round_mode: u32,
}

impl ParamBlock for GeluQuantParams {
    const LEN: usize = 13 * 8 + 6 * 4;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for v in [
            self.used_core_num,
            self.normal_core_process_num,
            self.tail_core_process_num,
            self.coexistent_node_num,
            self.coexistent_node_element_num,
            self.row_inner,
            self.row_outer,
            self.row_tail,
            self.col_inner,
            self.col_outer,
            self.col_tail,
            self.end_axis_len,
            self.end_axis_len_aligned,
        ] {
            w.write_u64::<LittleEndian>(v)?;
        }
        for v in [
            self.quant_mode,
            self.approximate,
            self.scale_type,
            self.offset_type,
            self.dst_type,
            self.round_mode,
        ] {
            w.write_u32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

/// Row and column blocking of `[front, end]` inside one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Blocking {
    row_inner: usize,
    row_outer: usize,
    row_tail: usize,
    col_inner: usize,
    col_outer: usize,
    col_tail: usize,
}

fn tail_or_full(len: usize, inner: usize) -> usize {
    match len.checked_rem(inner) {
        Some(0) => inner,
        Some(rest) => rest,
        None => len,
    }
}

#[derive(Debug, Clone)]
struct Split {
    template: GeluTemplate,
    partition: PartitionPlan,
    blocking: Blocking,
}

/// # GeluQuantTiling
///
/// GELU followed by int8 / fp8 quantization of `x[front.., end]`.
///
/// Scratch is modelled as a number of coexisting f32 vectors ("nodes"); every node holds
/// `node_elements` values. Templates pick between splitting the fused element count, whole rows
/// or slices of the end axis across units.
#[derive(Debug, Clone)]
pub struct GeluQuantTiling {
    x: Operand,
    scale: Option<Operand>,
    offset: Option<Operand>,
    mode: GeluQuantMode,
}

impl GeluQuantTiling {
    pub fn from_workload(
        mode: GeluQuantMode,
        workload: &WorkloadDescriptor,
    ) -> Result<Self, TilingError> {
        let expected = 1 + mode.scale as usize + mode.offset as usize;
        Enforcer::check_arity(&workload.operands, expected..=expected)?;
        let mut rest = workload.operands.iter().skip(1).cloned();
        let scale = if mode.scale { rest.next() } else { None };
        let offset = if mode.offset { rest.next() } else { None };
        Ok(Self {
            x: workload.operands[0].clone(),
            scale,
            offset,
            mode,
        })
    }

    fn end(&self) -> usize {
        self.x.shape.last_dim()
    }

    fn front(&self) -> usize {
        self.x.shape.front_numel()
    }

    fn scale_kind(&self) -> QuantTensorKind {
        QuantTensorKind::of(self.scale.as_ref())
    }

    /// Dynamic quantization computes its own offset.
    fn offset_kind(&self) -> QuantTensorKind {
        match self.mode.quant {
            QuantMode::Static => QuantTensorKind::of(self.offset.as_ref()),
            QuantMode::Dynamic => QuantTensorKind::Empty,
        }
    }

    fn nodes(&self) -> usize {
        match self.mode.quant {
            QuantMode::Static => STATIC_NODES,
            QuantMode::Dynamic => DYNAMIC_NODES,
        }
    }

    fn combination(&self, reason: &str) -> TilingError {
        VariantError::UnsupportedCombination {
            op: self.name(),
            reason: reason.to_string(),
        }
        .into()
    }

    fn check_channel(&self, operand: &Operand) -> Result<(), TilingError> {
        if operand.numel() == 1 {
            return Ok(());
        }
        Enforcer::assert_rank_range(operand, 1..=1)?;
        if operand.shape[0] != self.end() {
            return Err(InvariantError::ShapeMismatch {
                left: 0,
                right: self.x.shape.rank() - 1,
                a: operand.shape[0],
                b: self.end(),
            }
            .into());
        }
        Ok(())
    }

    fn split_static(&self, node_elements: usize, unit_count: usize) -> Split {
        let (front, end) = (self.front(), self.end());
        if front >= unit_count {
            // rows per pass, narrowed until every unit gets at least one pass
            let mut mul_rows = node_elements / end.align_up(F32_BLOCK);
            while mul_rows >= 2 && front.ceil_div(mul_rows) < unit_count {
                mul_rows -= 1;
            }
            if mul_rows < 2 {
                return Split {
                    template: GeluTemplate::Function,
                    partition: PartitionPlanner::ceil_block(front, unit_count, 1),
                    blocking: Blocking::default(),
                };
            }
            let row_outer = front.ceil_div(mul_rows);
            return Split {
                template: GeluTemplate::Performance,
                partition: PartitionPlanner::ceil_block(row_outer, unit_count, 1),
                blocking: Blocking {
                    row_inner: mul_rows,
                    row_outer,
                    row_tail: tail_or_full(front, mul_rows),
                    col_inner: end,
                    col_outer: 1,
                    col_tail: end,
                },
            };
        }

        let col_split = unit_count.ceil_div(front);
        let col_inner = match end.ceil_div(col_split) {
            n if n < MIN_UNIT_ELEMENTS => MIN_UNIT_ELEMENTS,
            n => n.align_down(MIN_UNIT_ELEMENTS),
        }
        .min(node_elements);
        let col_outer = end.ceil_div(col_inner);
        Split {
            template: GeluTemplate::Performance,
            partition: PartitionPlanner::ceil_block(front * col_outer, unit_count, 1),
            blocking: Blocking {
                row_inner: 1,
                row_outer: front,
                row_tail: 1,
                col_inner,
                col_outer,
                col_tail: tail_or_full(end, col_inner),
            },
        }
    }

    fn split(&self, node_elements: usize, unit_count: usize) -> Split {
        match (self.mode.quant, self.scale_kind()) {
            (QuantMode::Static, QuantTensorKind::Scalar) => Split {
                template: GeluTemplate::PerTensor,
                partition: PartitionPlanner::ceil_block(
                    self.x.numel(),
                    unit_count,
                    MIN_UNIT_ELEMENTS,
                ),
                blocking: Blocking::default(),
            },
            (QuantMode::Static, _) => self.split_static(node_elements, unit_count),
            (QuantMode::Dynamic, _) => {
                let mul_rows = node_elements / self.end().align_up(F32_BLOCK);
                let template = if mul_rows == 0 {
                    GeluTemplate::DynamicWorkspace
                } else {
                    GeluTemplate::DynamicNormal
                };
                Split {
                    template,
                    partition: PartitionPlanner::ceil_block(self.front(), unit_count, 1),
                    blocking: Blocking::default(),
                }
            }
        }
    }

    fn empty_split(&self) -> Split {
        let template = match (self.mode.quant, self.scale_kind()) {
            (QuantMode::Static, QuantTensorKind::Scalar) => GeluTemplate::PerTensor,
            (QuantMode::Static, _) => GeluTemplate::Function,
            (QuantMode::Dynamic, _) => GeluTemplate::DynamicNormal,
        };
        Split {
            template,
            partition: PartitionPlanner::ceil_block(0, 1, 1),
            blocking: Blocking::default(),
        }
    }
}

impl OpGuards for GeluQuantTiling {
    fn check_shapes(&self) -> Result<(), TilingError> {
        let min_rank = match self.mode.quant {
            QuantMode::Static => 1,
            QuantMode::Dynamic => 2,
        };
        Enforcer::assert_rank_range(&self.x, min_rank..=8)?;
        if let Some(scale) = &self.scale {
            self.check_channel(scale)?;
        }
        if let (QuantMode::Static, Some(offset)) = (self.mode.quant, &self.offset) {
            self.check_channel(offset)?;
            if self.offset_kind() != self.scale_kind() {
                return Err(self.combination("offset and scale must both be scalars or per-channel"));
            }
        }
        Ok(())
    }

    fn check_dtypes(&self) -> Result<(), TilingError> {
        let (x, dst) = (self.x.dtype, self.mode.dst);
        if !matches!(x, DType::F32 | DType::F16 | DType::BF16) {
            return Err(VariantError::UnsupportedDType {
                op: self.name(),
                dtype: x,
            }
            .into());
        }
        let round_ok = match dst {
            DType::I8 | DType::F8E5M2 | DType::F8E4M3 => self.mode.round == RoundMode::Rint,
            DType::HiF8 => matches!(self.mode.round, RoundMode::Round | RoundMode::Hybrid),
            _ => {
                return Err(VariantError::UnsupportedDType {
                    op: self.name(),
                    dtype: dst,
                }
                .into())
            }
        };
        if !round_ok {
            return Err(VariantError::UnsupportedCombination {
                op: self.name(),
                reason: format!("round mode {} for {dst}", self.mode.round),
            }
            .into());
        }
        if self.mode.quant == QuantMode::Static && self.scale.is_none() {
            return Err(self.combination("static quantization needs a scale"));
        }
        VariantSelector::gelu_dtypes(self.name(), x, self.scale.as_ref().map(|s| s.dtype))?;
        if let (QuantMode::Static, Some(scale), Some(offset)) =
            (self.mode.quant, &self.scale, &self.offset)
        {
            if scale.dtype != offset.dtype {
                return Err(InvariantError::DTypeMismatch {
                    expected: scale.dtype,
                    actual: offset.dtype,
                }
                .into());
            }
        }
        Ok(())
    }
}

impl OpTiling for GeluQuantTiling {
    fn name(&self) -> &'static str {
        "gelu_quant"
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError> {
        self.check_invariants()?;
        let scale_dtype = self.scale.as_ref().map(|s| s.dtype);
        let dtypes = VariantSelector::gelu_dtypes(self.name(), self.x.dtype, scale_dtype)?;
        let ub = capacity
            .scratch_budget
            .checked_sub(RESERVED_UB)
            .ok_or(InfeasibleError::Reserve {
                budget: capacity.scratch_budget,
                reserved: RESERVED_UB,
            })?;
        let nodes = self.nodes();
        let node_elements = (ub / (4 * nodes)).align_down(F32_BLOCK);
        if node_elements == 0 {
            return Err(InfeasibleError::BelowBlock {
                bytes: ub / nodes,
                align: F32_BLOCK * 4,
            }
            .into());
        }

        let split = if self.x.numel() == 0 {
            self.empty_split()
        } else {
            self.split(node_elements, capacity.unit_count)
        };
        let Split {
            template,
            partition,
            blocking,
        } = split;

        let workspace = match template {
            GeluTemplate::DynamicWorkspace => WorkspaceSizer::size(
                &WorkspacePolicy::spilling(SYSTEM_WORKSPACE, SpillRule::new(0, self.end() * 4)),
                0,
                partition.units_used,
            ),
            _ => SYSTEM_WORKSPACE,
        };
        let params = GeluQuantParams {
            used_core_num: partition.units_used as u64,
            normal_core_process_num: partition.body_len as u64,
            tail_core_process_num: partition.last_len as u64,
            coexistent_node_num: nodes as u64,
            coexistent_node_element_num: node_elements as u64,
            row_inner: blocking.row_inner as u64,
            row_outer: blocking.row_outer as u64,
            row_tail: blocking.row_tail as u64,
            col_inner: blocking.col_inner as u64,
            col_outer: blocking.col_outer as u64,
            col_tail: blocking.col_tail as u64,
            end_axis_len: self.end() as u64,
            end_axis_len_aligned: self.end().align_up(F32_BLOCK) as u64,
            quant_mode: self.mode.quant as u32,
            approximate: self.mode.approximate as u32,
            scale_type: self.scale_kind().code(),
            offset_type: self.offset_kind().code(),
            dst_type: self.mode.dst as u32,
            round_mode: self.mode.round as u32,
        };
        let buffer = BufferPlan {
            inner_tile: node_elements,
            tile_bytes: node_elements * 4,
            tile_rows: blocking.row_inner.max(1),
            double_buffered: false,
            regions: nodes,
            extra_reserved: RESERVED_UB,
        };
        let key = GeluQuantKey { template, dtypes };
        log::debug!(
            "{} front={} end={} -> {template} over {} units",
            self.name(),
            self.front(),
            self.end(),
            partition.units_used
        );
        Ok(TilingDescriptor {
            op: self.name(),
            variant: VariantKey::GeluQuant(key),
            partition: PartitionSection::Even(partition),
            buffer,
            workspace,
            params: OpParams::GeluQuant(params),
        })
    }
}
