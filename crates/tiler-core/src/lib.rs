mod align;
mod buffer;
mod capacity;
mod descriptor;
mod dtype;
mod enforcer;
mod error;
mod ops;
mod partition;
mod planner;
#[cfg(feature = "report")]
mod report;
mod shape;
mod variant;
mod workload;
mod workspace;

pub use align::*;
pub use buffer::*;
pub use capacity::*;
pub use descriptor::*;
pub use dtype::*;
pub use enforcer::*;
pub use error::*;
pub use ops::*;
pub use partition::*;
pub use planner::*;
#[cfg(feature = "report")]
pub use report::*;
pub use shape::*;
pub use variant::*;
pub use workload::*;
pub use workspace::*;

use smallvec::SmallVec;
pub type RVec<T> = SmallVec<[T; 4]>;

//https://github.com/sonos/tract/blob/main/data/src/macros.rs#L2
#[macro_export]
macro_rules! rvec {
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::RVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ rvec![@one $x])*;
        #[allow(unused_mut)]
        let mut vec = $crate::RVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::RVec::from_vec(vec![$($x,)*])
        }
    });
}

#[macro_export]
macro_rules! shape {
    ($($x:expr),*$(,)*) => ({
        use $crate::rvec;
        $crate::Shape::new(rvec![$($x,)*])
    });
}

pub mod prelude {
    pub use crate::{
        plan, rvec, shape, CapacityModel, DType, HardwareProfile, Operand, OperatorKind,
        TilingDescriptor, WorkloadDescriptor,
    };
}
