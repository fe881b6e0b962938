use derive_new::new;
use itertools::Itertools;

use crate::{Align, CapacityModel, ConfigError};

#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct UnitRange {
    pub start: usize,
    pub end: usize,
}

impl UnitRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// # PartitionPlan
///
/// An even split of an outer dimension. The layout is two-level: the first `head_units` units
/// take `head_len` elements, the rest take `body_len`, and the final unit takes `last_len`.
/// This is exactly what the kernel needs to recompute its own range from its unit index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionPlan {
    pub outer: usize,
    pub units_used: usize,
    pub group: usize,
    pub head_units: usize,
    pub head_len: usize,
    pub body_len: usize,
    pub last_len: usize,
}

impl PartitionPlan {
    fn idle() -> Self {
        Self {
            outer: 0,
            units_used: 1,
            group: 1,
            head_units: 0,
            head_len: 0,
            body_len: 0,
            last_len: 0,
        }
    }

    pub fn unit_len(&self, unit: usize) -> usize {
        if unit + 1 == self.units_used {
            self.last_len
        } else if unit < self.head_units {
            self.head_len
        } else {
            self.body_len
        }
    }

    pub fn ranges(&self) -> Vec<UnitRange> {
        let mut start = 0;
        (0..self.units_used)
            .map(|unit| {
                let len = self.unit_len(unit);
                let range = UnitRange::new(start, start + len);
                start += len;
                range
            })
            .collect()
    }

    /// The last range, when it differs from a regular unit.
    pub fn tail(&self) -> Option<UnitRange> {
        let regular = if self.units_used - 1 < self.head_units {
            self.head_len
        } else {
            self.body_len
        };
        if self.last_len == regular {
            return None;
        }
        self.ranges().last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.outer == 0
    }
}

/// Position inside a ragged list of rows.
#[derive(Debug, Clone, Copy, Default, new, PartialEq, Eq, Hash)]
pub struct RowCursor {
    pub row: usize,
    pub offset: usize,
}

/// One unit's contiguous slice of a ragged workload, `end` is exclusive.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct RaggedSpan {
    pub start: RowCursor,
    pub end: RowCursor,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RaggedPlan {
    pub rows: Vec<usize>,
    pub group: usize,
    pub spans: Vec<RaggedSpan>,
}

impl RaggedPlan {
    pub fn units_used(&self) -> usize {
        self.spans.len()
    }

    pub fn total(&self) -> usize {
        self.rows.iter().sum()
    }

    /// Per-row coverage as `(row, start, end)` pieces, in unit order.
    pub fn pieces(&self, unit: usize) -> Vec<(usize, usize, usize)> {
        let Some(span) = self.spans.get(unit) else {
            return vec![];
        };
        let mut pieces = vec![];
        let mut cursor = span.start;
        let mut left = span.len;
        while left > 0 && cursor.row < self.rows.len() {
            let take = (self.rows[cursor.row] - cursor.offset).min(left);
            if take > 0 {
                pieces.push((cursor.row, cursor.offset, cursor.offset + take));
            }
            left -= take;
            cursor = RowCursor::new(cursor.row + 1, 0);
        }
        pieces
    }
}

/// # PartitionPlanner
///
/// Splits work across compute units. Every plan covers its input exactly once and uses at least
/// one unit, an empty workload maps to a single idle unit.
pub struct PartitionPlanner;

impl PartitionPlanner {
    /// Balanced split in blocks of `group` elements.
    ///
    /// The first `blocks % units` units take one extra block, so unit sizes differ by at most one
    /// block. Only the final unit can be short, when the last block is partial.
    pub fn balanced(
        outer: usize,
        capacity: &CapacityModel,
        group: usize,
    ) -> Result<PartitionPlan, ConfigError> {
        if capacity.unit_count == 0 {
            return Err(ConfigError::ZeroUnits);
        }
        let group = group.max(1);
        let blocks = outer.ceil_div(group);
        if blocks == 0 {
            return Ok(PartitionPlan::idle());
        }
        let units_used = capacity.unit_count.min(blocks);
        let base = blocks / units_used;
        let remainder = blocks % units_used;
        let shortfall = blocks * group - outer;

        let body_len = base * group;
        let head_len = body_len + group;
        let last_regular = if units_used - 1 < remainder {
            head_len
        } else {
            body_len
        };
        let plan = PartitionPlan {
            outer,
            units_used,
            group,
            head_units: remainder,
            head_len,
            body_len,
            last_len: last_regular - shortfall,
        };
        log::debug!("Balanced partition of {outer} in groups of {group}: {plan:?}");
        Ok(plan)
    }

    /// Ceil-block split: every unit takes `per_unit` elements (at least `min_per_unit`), the last
    /// one takes what is left.
    pub fn ceil_block(outer: usize, unit_count: usize, min_per_unit: usize) -> PartitionPlan {
        if outer == 0 {
            return PartitionPlan::idle();
        }
        let per_unit = outer
            .ceil_div(unit_count.max(1))
            .max(min_per_unit)
            .min(outer);
        let units_used = outer.ceil_div(per_unit);
        PartitionPlan {
            outer,
            units_used,
            group: 1,
            head_units: 0,
            head_len: 0,
            body_len: per_unit,
            last_len: outer - per_unit * (units_used - 1),
        }
    }

    /// Balanced split over the concatenation of ragged rows.
    ///
    /// Work is quantised into blocks of `group` elements and dealt out like
    /// [`PartitionPlanner::balanced`], but a unit's quota may begin and end inside a row.
    /// The final unit absorbs the partial last block.
    pub fn ragged(
        rows: &[usize],
        capacity: &CapacityModel,
        group: usize,
    ) -> Result<RaggedPlan, ConfigError> {
        if capacity.unit_count == 0 {
            return Err(ConfigError::ZeroUnits);
        }
        let group = group.max(1);
        let total: usize = rows.iter().sum();
        let blocks = total.ceil_div(group);
        let units = capacity.unit_count.min(blocks).max(1);
        let base = blocks / units * group;
        let remainder = blocks % units;

        let mut spans = Vec::with_capacity(units);
        let mut cursor = RowCursor::default();
        let mut remaining = total;
        for unit in 0..units {
            let quota = if unit < remainder { base + group } else { base };
            let len = if unit + 1 == units {
                remaining
            } else {
                quota.min(remaining)
            };
            remaining -= len;

            let start = cursor;
            let mut end = cursor;
            let mut need = len;
            while need > 0 {
                let avail = rows[end.row] - end.offset;
                if avail == 0 {
                    end = RowCursor::new(end.row + 1, 0);
                    continue;
                }
                let take = avail.min(need);
                end.offset += take;
                need -= take;
            }
            spans.push(RaggedSpan::new(start, end, len));

            let row_done = rows.get(end.row).is_some_and(|&r| end.offset == r);
            cursor = if row_done && end.row + 1 < rows.len() {
                RowCursor::new(end.row + 1, 0)
            } else {
                end
            };
        }

        let sizes = spans.iter().map(|s| s.len).collect_vec();
        log::debug!("Ragged partition of {total} over {units} units: {sizes:?}");
        Ok(RaggedPlan {
            rows: rows.to_vec(),
            group,
            spans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::{proptest, Arbitrary};

    fn units(n: usize) -> CapacityModel {
        CapacityModel::new(n, 4096, 32, false)
    }

    #[test]
    fn hundred_over_eight() -> anyhow::Result<()> {
        let plan = PartitionPlanner::balanced(100, &units(8), 1)?;
        assert_eq!(plan.units_used, 8);
        let sizes = plan.ranges().iter().map(UnitRange::len).collect_vec();
        assert_eq!(sizes, vec![13, 13, 13, 13, 12, 12, 12, 12]);
        assert_eq!(plan.ranges().last().map(|r| r.end), Some(100));
        assert!(plan.tail().is_none());
        Ok(())
    }

    #[test]
    fn empty_outer_is_one_idle_unit() -> anyhow::Result<()> {
        let plan = PartitionPlanner::balanced(0, &units(8), 1)?;
        assert_eq!(plan.units_used, 1);
        assert_eq!(plan.ranges(), vec![UnitRange::new(0, 0)]);
        assert!(plan.is_empty());

        let ragged = PartitionPlanner::ragged(&[0, 0], &units(8), 8)?;
        assert_eq!(ragged.units_used(), 1);
        assert_eq!(ragged.spans[0].len, 0);
        Ok(())
    }

    #[test]
    fn fewer_elements_than_units() -> anyhow::Result<()> {
        let plan = PartitionPlanner::balanced(3, &units(8), 1)?;
        assert_eq!(plan.units_used, 3);
        assert!(plan.ranges().iter().all(|r| r.len() == 1));
        Ok(())
    }

    #[test]
    fn zero_units_is_a_config_error() {
        assert!(matches!(
            PartitionPlanner::balanced(10, &units(0), 1),
            Err(ConfigError::ZeroUnits)
        ));
        assert!(matches!(
            PartitionPlanner::ragged(&[10], &units(0), 1),
            Err(ConfigError::ZeroUnits)
        ));
    }

    #[test]
    fn partial_last_block_shortens_last_unit() -> anyhow::Result<()> {
        let plan = PartitionPlanner::balanced(100, &units(3), 16)?;
        // 7 blocks of 16: 3, 2, 2 blocks, the last one short by 12
        let sizes = plan.ranges().iter().map(UnitRange::len).collect_vec();
        assert_eq!(sizes, vec![48, 32, 20]);
        assert_eq!(plan.tail(), Some(UnitRange::new(80, 100)));
        Ok(())
    }

    #[test]
    fn ragged_rows_split_inside_a_row() -> anyhow::Result<()> {
        let plan = PartitionPlanner::ragged(&[50, 3, 200], &units(2), 8)?;
        assert_eq!(plan.units_used(), 2);
        let first = plan.spans[0];
        let second = plan.spans[1];
        assert_eq!((first.len, second.len), (128, 125));
        assert_eq!(first.start, RowCursor::new(0, 0));
        assert_eq!(first.end, RowCursor::new(2, 75));
        assert_eq!(second.start, RowCursor::new(2, 75));
        assert_eq!(second.end, RowCursor::new(2, 200));
        assert_eq!(plan.pieces(0), vec![(0, 0, 50), (1, 0, 3), (2, 0, 75)]);
        assert_eq!(plan.pieces(1), vec![(2, 75, 200)]);
        Ok(())
    }

    #[test]
    fn ragged_span_ending_on_row_boundary() -> anyhow::Result<()> {
        let plan = PartitionPlanner::ragged(&[16, 16], &units(2), 8)?;
        assert_eq!(plan.spans[0].end, RowCursor::new(0, 16));
        assert_eq!(plan.spans[1].start, RowCursor::new(1, 0));
        Ok(())
    }

    #[test]
    fn ceil_block_tail() {
        let plan = PartitionPlanner::ceil_block(100, 8, 1);
        assert_eq!(plan.body_len, 13);
        assert_eq!(plan.units_used, 8);
        assert_eq!(plan.last_len, 9);

        let plan = PartitionPlanner::ceil_block(100, 8, 64);
        assert_eq!((plan.units_used, plan.body_len, plan.last_len), (2, 64, 36));
    }

    #[derive(Arbitrary, Debug)]
    struct BalancedProblem {
        #[strategy(0..=10_000usize)]
        outer: usize,
        #[strategy(1..=64usize)]
        unit_count: usize,
        #[strategy(1..=32usize)]
        group: usize,
    }

    #[proptest(cases = 256)]
    fn balanced_covers_exactly_once(prob: BalancedProblem) {
        let BalancedProblem {
            outer,
            unit_count,
            group,
        } = prob;
        let plan = PartitionPlanner::balanced(outer, &units(unit_count), group).unwrap();
        assert!(plan.units_used >= 1 && plan.units_used <= unit_count);

        let ranges = plan.ranges();
        let mut expected = 0;
        for range in ranges.iter() {
            assert_eq!(range.start, expected);
            expected = range.end;
        }
        assert_eq!(expected, outer);

        let full = &ranges[..ranges.len() - 1];
        if let (Some(max), Some(min)) = (
            full.iter().map(UnitRange::len).max(),
            full.iter().map(UnitRange::len).min(),
        ) {
            assert!(max - min <= group);
        }
    }

    #[derive(Arbitrary, Debug)]
    struct RaggedProblem {
        #[strategy(proptest::collection::vec(0..300usize, 1..12))]
        rows: Vec<usize>,
        #[strategy(1..=16usize)]
        unit_count: usize,
        #[strategy(proptest::sample::select(vec![4usize, 8, 16, 32]))]
        group: usize,
    }

    #[proptest(cases = 256)]
    fn ragged_covers_every_row_once(prob: RaggedProblem) {
        let plan = PartitionPlanner::ragged(&prob.rows, &units(prob.unit_count), prob.group).unwrap();
        let mut covered = vec![0usize; prob.rows.len()];
        let mut next = (0, 0);
        for unit in 0..plan.units_used() {
            for (row, start, end) in plan.pieces(unit) {
                if row == next.0 {
                    assert_eq!(start, next.1);
                } else {
                    assert_eq!(start, 0);
                }
                covered[row] += end - start;
                next = (row, end);
            }
        }
        assert_eq!(covered, prob.rows);

        let lens = plan.spans.iter().map(|s| s.len).collect_vec();
        let body = &lens[..lens.len() - 1];
        if let (Some(max), Some(min)) = (body.iter().max(), body.iter().min()) {
            assert!(max - min <= prob.group);
        }
        assert_eq!(lens.iter().sum::<usize>(), plan.total());
    }
}
