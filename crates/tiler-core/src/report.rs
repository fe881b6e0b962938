use itertools::Itertools;
use tabled::settings::{object::Rows, Alignment, Modify, Panel, Style};
use tabled::{Table, Tabled};

use crate::{PartitionSection, TilingDescriptor};

#[derive(Tabled)]
struct SummaryEntry {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

pub fn build_summary_table(desc: &TilingDescriptor) -> Table {
    let buffer = &desc.buffer;
    let entries = [
        ("Operator", desc.op.to_string()),
        (
            "Variant",
            format!("{} ({})", desc.variant.name(), desc.variant.code()),
        ),
        ("Units", desc.units_used().to_string()),
        ("Inner tile", buffer.inner_tile.to_string()),
        ("Tile bytes", buffer.tile_bytes.to_string()),
        ("Tile rows", buffer.tile_rows.to_string()),
        ("Regions", buffer.regions.to_string()),
        ("Double buffered", buffer.double_buffered.to_string()),
        ("Extra reserved", buffer.extra_reserved.to_string()),
        ("Occupancy", buffer.occupancy().to_string()),
        ("Workspace", desc.workspace.to_string()),
    ]
    .into_iter()
    .map(|(field, value)| SummaryEntry { field, value })
    .collect_vec();

    Table::new(&entries)
        .with(Style::modern())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .with(Modify::new(Rows::new(1..)).with(Alignment::left()))
        .with(Panel::footer(format!("{} byte record", desc.encoded_len())))
        .to_owned()
}

#[derive(Tabled)]
struct UnitEntry {
    #[tabled(rename = "Unit")]
    unit: usize,
    #[tabled(rename = "Elements")]
    len: usize,
    #[tabled(rename = "Range")]
    range: String,
}

/// One row per compute unit. Ragged spans list the `row[start..end]` pieces they cover.
pub fn build_unit_table(desc: &TilingDescriptor) -> Table {
    let entries = match &desc.partition {
        PartitionSection::Even(plan) => plan
            .ranges()
            .iter()
            .enumerate()
            .map(|(unit, r)| UnitEntry {
                unit,
                len: r.len(),
                range: format!("{}..{}", r.start, r.end),
            })
            .collect_vec(),
        PartitionSection::Ragged(plan) => plan
            .spans
            .iter()
            .enumerate()
            .map(|(unit, span)| UnitEntry {
                unit,
                len: span.len,
                range: plan
                    .pieces(unit)
                    .iter()
                    .map(|(row, start, end)| format!("{row}[{start}..{end}]"))
                    .join(" "),
            })
            .collect_vec(),
    };

    Table::new(&entries)
        .with(Style::modern())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .with(Modify::new(Rows::new(1..)).with(Alignment::left()))
        .to_owned()
}
