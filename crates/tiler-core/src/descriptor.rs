use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use bytemuck::{Pod, Zeroable};

use crate::{
    AvgPool3dParams, BufferPlan, EmbeddingGradParams, ForeachParams, GeluQuantParams,
    MatmulParams, PartitionPlan, RaggedPlan, RmsNormParams, TilingError, VariantKey,
};

/// Row slots in a ragged record.
pub const MAX_TENSORS: usize = 50;
/// Unit slots in a ragged record.
pub const MAX_UNITS: usize = 50;

pub const HEADER_LEN: usize = std::mem::size_of::<RecordHeader>();
pub const EVEN_SECTION_LEN: usize = 5 * 8;
/// One unit slot: `u16` start row, `u16` end row, `i64` start offset, `i64` inclusive end
/// offset. A unit with no elements stores `start offset - 1` as its end, so the kernel's
/// `end - start + 1` count is zero. Unused slots are all zero bytes.
const RAGGED_SLOT_LEN: usize = 2 + 2 + 8 + 8;
pub const RAGGED_SECTION_LEN: usize = MAX_TENSORS * 8 + MAX_UNITS * RAGGED_SLOT_LEN;

/// # RecordHeader
///
/// Leading 48 bytes of every record, little-endian on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RecordHeader {
    pub variant: u64,
    pub workspace: u64,
    pub units: u32,
    pub double_buffered: u32,
    pub inner_tile: u64,
    pub tile_rows: u64,
    pub extra_reserved: u64,
}

impl RecordHeader {
    pub fn read(bytes: &[u8]) -> Result<Self, TilingError> {
        let head = bytes.get(..HEADER_LEN).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("record of {} bytes has no header", bytes.len()),
            )
        })?;
        let raw: RecordHeader = bytemuck::pod_read_unaligned(head);
        Ok(Self {
            variant: u64::from_le(raw.variant),
            workspace: u64::from_le(raw.workspace),
            units: u32::from_le(raw.units),
            double_buffered: u32::from_le(raw.double_buffered),
            inner_tile: u64::from_le(raw.inner_tile),
            tile_rows: u64::from_le(raw.tile_rows),
            extra_reserved: u64::from_le(raw.extra_reserved),
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LittleEndian>(self.variant)?;
        w.write_u64::<LittleEndian>(self.workspace)?;
        w.write_u32::<LittleEndian>(self.units)?;
        w.write_u32::<LittleEndian>(self.double_buffered)?;
        w.write_u64::<LittleEndian>(self.inner_tile)?;
        w.write_u64::<LittleEndian>(self.tile_rows)?;
        w.write_u64::<LittleEndian>(self.extra_reserved)
    }
}

/// A fixed-size operator parameter block.
pub trait ParamBlock {
    const LEN: usize;

    fn write_le<W: Write>(&self, w: &mut W) -> std::io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionSection {
    Even(PartitionPlan),
    Ragged(RaggedPlan),
}

impl PartitionSection {
    pub fn units_used(&self) -> usize {
        match self {
            PartitionSection::Even(p) => p.units_used,
            PartitionSection::Ragged(p) => p.units_used(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            PartitionSection::Even(_) => EVEN_SECTION_LEN,
            PartitionSection::Ragged(_) => RAGGED_SECTION_LEN,
        }
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            PartitionSection::Even(plan) => {
                for v in [
                    plan.outer,
                    plan.head_len,
                    plan.head_units,
                    plan.body_len,
                    plan.last_len,
                ] {
                    w.write_u64::<LittleEndian>(v as u64)?;
                }
                Ok(())
            }
            PartitionSection::Ragged(plan) => Self::write_ragged(plan, w),
        }
    }

    fn write_ragged<W: Write>(plan: &RaggedPlan, w: &mut W) -> std::io::Result<()> {
        if plan.rows.len() > MAX_TENSORS || plan.spans.len() > MAX_UNITS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "ragged plan of {} rows over {} units does not fit the record",
                    plan.rows.len(),
                    plan.spans.len()
                ),
            ));
        }
        for slot in 0..MAX_TENSORS {
            let len = plan.rows.get(slot).copied().unwrap_or_default();
            w.write_i64::<LittleEndian>(len as i64)?;
        }
        for slot in 0..MAX_UNITS {
            match plan.spans.get(slot) {
                Some(span) => {
                    let start = span.start.offset as i64;
                    let last = match span.len {
                        0 => start - 1,
                        _ => span.end.offset as i64 - 1,
                    };
                    w.write_u16::<LittleEndian>(span.start.row as u16)?;
                    w.write_u16::<LittleEndian>(span.end.row as u16)?;
                    w.write_i64::<LittleEndian>(start)?;
                    w.write_i64::<LittleEndian>(last)?;
                }
                None => w.write_all(&[0u8; RAGGED_SLOT_LEN])?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    Foreach(ForeachParams),
    RmsNorm(RmsNormParams),
    EmbeddingDenseGrad(EmbeddingGradParams),
    GeluQuant(GeluQuantParams),
    AvgPool3d(AvgPool3dParams),
    TransposeBatchMatmul(MatmulParams),
}

impl OpParams {
    pub fn encoded_len(&self) -> usize {
        match self {
            OpParams::Foreach(_) => ForeachParams::LEN,
            OpParams::RmsNorm(_) => RmsNormParams::LEN,
            OpParams::EmbeddingDenseGrad(_) => EmbeddingGradParams::LEN,
            OpParams::GeluQuant(_) => GeluQuantParams::LEN,
            OpParams::AvgPool3d(_) => AvgPool3dParams::LEN,
            OpParams::TransposeBatchMatmul(_) => MatmulParams::LEN,
        }
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            OpParams::Foreach(p) => p.write_le(w),
            OpParams::RmsNorm(p) => p.write_le(w),
            OpParams::EmbeddingDenseGrad(p) => p.write_le(w),
            OpParams::GeluQuant(p) => p.write_le(w),
            OpParams::AvgPool3d(p) => p.write_le(w),
            OpParams::TransposeBatchMatmul(p) => p.write_le(w),
        }
    }
}

/// # TilingDescriptor
///
/// The complete output of one planning call. The byte record is a pure function of this value.
#[derive(Debug, Clone, PartialEq)]
pub struct TilingDescriptor {
    pub op: &'static str,
    pub variant: VariantKey,
    pub partition: PartitionSection,
    pub buffer: BufferPlan,
    pub workspace: usize,
    pub params: OpParams,
}

impl TilingDescriptor {
    pub fn units_used(&self) -> usize {
        self.partition.units_used()
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            variant: self.variant.code(),
            workspace: self.workspace as u64,
            units: self.units_used() as u32,
            double_buffered: self.buffer.double_buffered as u32,
            inner_tile: self.buffer.inner_tile as u64,
            tile_rows: self.buffer.tile_rows as u64,
            extra_reserved: self.buffer.extra_reserved as u64,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.partition.encoded_len() + self.params.encoded_len()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), TilingError> {
        self.header().write(w)?;
        self.partition.write(w)?;
        self.params.write(w)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TilingError> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        self.write(&mut bytes)?;
        Ok(bytes)
    }
}
