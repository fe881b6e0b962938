mod avg_pool3d;
mod batch_matmul;
mod embedding_grad;
mod foreach;
mod gelu_quant;
mod rms_norm;

pub use avg_pool3d::*;
pub use batch_matmul::*;
pub use embedding_grad::*;
pub use foreach::*;
pub use gelu_quant::*;
pub use rms_norm::*;

use std::fmt::Debug;

use crate::{CapacityModel, TilingDescriptor, TilingError};

/// Scratch every reduction style kernel keeps back for its own bookkeeping.
pub const RESERVED_UB: usize = 1024;

pub trait OpGuards {
    fn check_shapes(&self) -> Result<(), TilingError>;

    fn check_dtypes(&self) -> Result<(), TilingError>;
}

/// # OpTiling
///
/// Implemented by every operator planner. A planner is built from a workload, checks its own
/// invariants, and turns a capacity model into a descriptor.
pub trait OpTiling: OpGuards + Debug {
    fn name(&self) -> &'static str;

    fn check_invariants(&self) -> Result<(), TilingError> {
        self.check_shapes()?;
        self.check_dtypes()?;
        Ok(())
    }

    fn plan(&self, capacity: &CapacityModel) -> Result<TilingDescriptor, TilingError>;
}
