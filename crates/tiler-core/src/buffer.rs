use derive_new::new;

use crate::{Align, CapacityModel};

#[derive(Debug, thiserror::Error)]
pub enum InfeasibleError {
    #[error("Reserved {reserved} bytes leave nothing of the {budget} byte scratch budget.")]
    Reserve { budget: usize, reserved: usize },
    #[error("Per-region scratch of {bytes} bytes is below one {align} byte block.")]
    BelowBlock { bytes: usize, align: usize },
    #[error("Shrinking from {start} found no candidate that fits.")]
    ShrinkExhausted { start: usize },
    #[error("No tile shape for {op} fits in {budget} bytes of scratch.")]
    NoFit { op: &'static str, budget: usize },
}

/// # BufferRequest
///
/// Everything the closed form needs to carve one unit's scratch into equal regions.
/// Built with [`BufferRequest::new`] and refined with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    pub width: usize,
    pub live_buffers: usize,
    pub double_buffered: bool,
    /// Bytes taken by the tiling record itself.
    pub overhead: usize,
    /// Operator scratch outside the data regions.
    pub reserve: usize,
    /// Halve `reserve` until it leaves room, instead of failing outright.
    pub attenuate_reserve: bool,
    /// Hold back all but `1 / divider` of the usable bytes for a widening cast.
    pub cast_divider: Option<usize>,
    pub region_slack: usize,
    /// `(num, den)` applied to each region, for routines that interleave a mask with data.
    pub repeat_ratio: Option<(usize, usize)>,
    pub wide_alignment: bool,
    pub repeat_align: Option<usize>,
}

impl BufferRequest {
    pub fn new(width: usize, live_buffers: usize, double_buffered: bool) -> Self {
        Self {
            width,
            live_buffers,
            double_buffered,
            overhead: 0,
            reserve: 0,
            attenuate_reserve: false,
            cast_divider: None,
            region_slack: 0,
            repeat_ratio: None,
            wide_alignment: false,
            repeat_align: None,
        }
    }

    pub fn with_overhead(mut self, overhead: usize) -> Self {
        self.overhead = overhead;
        self
    }

    pub fn with_reserve(mut self, reserve: usize, attenuate: bool) -> Self {
        self.reserve = reserve;
        self.attenuate_reserve = attenuate;
        self
    }

    pub fn with_cast(mut self, divider: usize) -> Self {
        self.cast_divider = Some(divider);
        self
    }

    /// Round regions to twice the capacity alignment.
    pub fn with_wide_alignment(mut self, wide: bool) -> Self {
        self.wide_alignment = wide;
        self
    }

    pub fn with_slack(mut self, slack: usize) -> Self {
        self.region_slack = slack;
        self
    }

    pub fn with_ratio(mut self, num: usize, den: usize) -> Self {
        self.repeat_ratio = Some((num, den));
        self
    }

    pub fn with_repeat_align(mut self, bytes: usize) -> Self {
        self.repeat_align = Some(bytes);
        self
    }

    pub fn regions(&self) -> usize {
        let depth = if self.double_buffered { 2 } else { 1 };
        (self.live_buffers * depth).max(1)
    }
}

/// # BufferPlan
///
/// Per-unit scratch layout. `tile_bytes * regions + extra_reserved` never exceeds the budget
/// the plan was sized against.
#[derive(Debug, Clone, Default, new, PartialEq, Eq, Hash)]
pub struct BufferPlan {
    pub inner_tile: usize,
    pub tile_bytes: usize,
    pub tile_rows: usize,
    pub double_buffered: bool,
    pub regions: usize,
    pub extra_reserved: usize,
}

impl BufferPlan {
    pub fn occupancy(&self) -> usize {
        self.tile_bytes * self.regions + self.extra_reserved
    }

    pub fn fits(&self, capacity: &CapacityModel) -> bool {
        self.occupancy() <= capacity.scratch_budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkStep {
    Decrement(usize),
    Halve,
}

impl ShrinkStep {
    fn next(&self, candidate: usize) -> usize {
        match self {
            ShrinkStep::Decrement(n) => candidate.saturating_sub((*n).max(1)),
            ShrinkStep::Halve => candidate / 2,
        }
    }
}

pub struct BufferSizer;

impl BufferSizer {
    pub fn closed_form(
        req: &BufferRequest,
        capacity: &CapacityModel,
    ) -> Result<BufferPlan, InfeasibleError> {
        let budget = capacity.scratch_budget;
        let mut reserve = req.reserve;
        if req.attenuate_reserve {
            while reserve > 0 && budget <= req.overhead + reserve {
                reserve /= 2;
            }
        }

        let fixed = req.overhead + reserve;
        let usable = budget
            .checked_sub(fixed)
            .filter(|u| *u > 0)
            .ok_or(InfeasibleError::Reserve {
                budget,
                reserved: fixed,
            })?;
        let castable = req.cast_divider.map_or(usable, |d| usable / d.max(1));
        let holdback = usable - castable;

        let regions = req.regions();
        let align = if req.wide_alignment {
            capacity.alignment * 2
        } else {
            capacity.alignment
        };
        let raw = castable / regions;
        let mut per_region = raw.saturating_sub(req.region_slack);
        if let Some((num, den)) = req.repeat_ratio {
            per_region = per_region * num / den.max(1);
        }
        let mut tile_bytes = per_region.align_down(align);
        if let Some(repeat) = req.repeat_align {
            tile_bytes = tile_bytes.align_down(repeat);
        }
        if tile_bytes == 0 {
            return Err(InfeasibleError::BelowBlock {
                bytes: per_region,
                align,
            });
        }

        let plan = BufferPlan {
            inner_tile: tile_bytes / req.width.max(1),
            tile_bytes,
            tile_rows: 1,
            double_buffered: req.double_buffered,
            regions,
            extra_reserved: fixed + holdback + req.region_slack * regions,
        };
        log::debug!("Closed form buffer plan for {req:?}: {plan:?}");
        Ok(plan)
    }

    /// Walk `start` down by `step` until `fits` accepts a candidate.
    ///
    /// Every iteration strictly decreases the candidate, so the loop runs at most `start` times.
    /// Zero is never offered to `fits`.
    pub fn shrink<F>(start: usize, step: ShrinkStep, mut fits: F) -> Result<usize, InfeasibleError>
    where
        F: FnMut(usize) -> bool,
    {
        let mut candidate = start;
        for _ in 0..start {
            if candidate == 0 {
                break;
            }
            if fits(candidate) {
                return Ok(candidate);
            }
            candidate = step.next(candidate);
        }
        Err(InfeasibleError::ShrinkExhausted { start })
    }

    /// Largest value in `[lo, hi]` accepted by a monotone `fits`.
    pub fn largest_fitting<F>(lo: usize, hi: usize, mut fits: F) -> Result<usize, InfeasibleError>
    where
        F: FnMut(usize) -> bool,
    {
        if lo > hi || !fits(lo) {
            return Err(InfeasibleError::ShrinkExhausted { start: hi });
        }
        let (mut good, mut bad) = (lo, hi + 1);
        while bad - good > 1 {
            let mid = good + (bad - good) / 2;
            if fits(mid) {
                good = mid;
            } else {
                bad = mid;
            }
        }
        Ok(good)
    }
}
