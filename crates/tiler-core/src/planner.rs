use crate::{
    AvgPool3dTiling, CapacityModel, EmbeddingGradTiling, ForeachTiling, GeluQuantTiling,
    MatmulTiling, OpTiling, OperatorKind, ReserveTable, RmsNormTiling, TilingDescriptor,
    TilingError, WorkloadDescriptor,
};

/// # plan
///
/// Plans one workload against one capacity model, using the default foreach reserve table.
///
/// ```
/// use tiler::prelude::*;
///
/// let capacity = HardwareProfile::standard().capacity().unwrap();
/// let workload = WorkloadDescriptor::new(
///     rvec![Operand::new(shape![1024], DType::F32)],
///     OperatorKind::Foreach(tiler::ForeachOp::Abs),
/// );
/// let desc = plan(&workload, &capacity).unwrap();
/// assert_eq!(desc.to_bytes().unwrap().len(), desc.encoded_len());
/// ```
pub fn plan(
    workload: &WorkloadDescriptor,
    capacity: &CapacityModel,
) -> Result<TilingDescriptor, TilingError> {
    plan_with_reserves(workload, capacity, &ReserveTable::default())
}

/// Plans with a caller supplied reserve table for the foreach family.
pub fn plan_with_reserves(
    workload: &WorkloadDescriptor,
    capacity: &CapacityModel,
    reserves: &ReserveTable,
) -> Result<TilingDescriptor, TilingError> {
    capacity.validate()?;
    let tiling: Box<dyn OpTiling> = match workload.op {
        OperatorKind::Foreach(op) => Box::new(ForeachTiling::from_workload(op, workload, reserves)?),
        OperatorKind::RmsNorm(mode) => Box::new(RmsNormTiling::from_workload(mode, workload)?),
        OperatorKind::EmbeddingDenseGrad(mode) => {
            Box::new(EmbeddingGradTiling::from_workload(mode, workload)?)
        }
        OperatorKind::GeluQuant(mode) => Box::new(GeluQuantTiling::from_workload(mode, workload)?),
        OperatorKind::AvgPool3d(mode) => Box::new(AvgPool3dTiling::from_workload(mode, workload)?),
        OperatorKind::TransposeBatchMatmul(mode) => {
            Box::new(MatmulTiling::from_workload(mode, workload)?)
        }
    };
    log::debug!("Planning {tiling:?} on {capacity:?}");

    let desc = tiling.plan(capacity)?;
    log::info!(
        "{}: variant {} over {} units, tile {} elements, workspace {} bytes",
        desc.op,
        desc.variant.code(),
        desc.units_used(),
        desc.buffer.inner_tile,
        desc.workspace
    );
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rvec, shape, ConfigError, DType, ForeachOp, InvariantError, Operand, RmsNormMode,
        VariantError,
    };

    fn abs(rows: &[usize]) -> WorkloadDescriptor {
        let operands = rows
            .iter()
            .map(|r| Operand::new(shape![*r], DType::F32))
            .collect();
        WorkloadDescriptor::new(operands, OperatorKind::Foreach(ForeachOp::Abs))
    }

    #[test]
    fn invalid_capacity_is_rejected_first() {
        let _ = env_logger::builder().is_test(true).try_init();
        let zero = CapacityModel::new(0, 196_608, 32, true);
        assert!(matches!(
            plan(&abs(&[16]), &zero),
            Err(TilingError::Config(ConfigError::ZeroUnits))
        ));
        let odd = CapacityModel::new(8, 196_608, 24, true);
        assert!(matches!(
            plan(&abs(&[16]), &odd),
            Err(TilingError::Config(ConfigError::Alignment(24)))
        ));
    }

    #[test]
    fn missing_reserve_entry() {
        let capacity = CapacityModel::new(8, 196_608, 32, true);
        assert!(matches!(
            plan_with_reserves(&abs(&[16]), &capacity, &ReserveTable::empty()),
            Err(TilingError::Config(ConfigError::MissingReserve(ForeachOp::Abs)))
        ));
    }

    #[test]
    fn dispatch_names() -> anyhow::Result<()> {
        let capacity = CapacityModel::new(8, 196_608, 32, true);
        assert_eq!(plan(&abs(&[16, 16]), &capacity)?.op, "abs");

        let norm = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![4, 64], DType::F32),
                Operand::new(shape![64], DType::F32),
            ],
            OperatorKind::RmsNorm(RmsNormMode::default()),
        );
        assert_eq!(plan(&norm, &capacity)?.op, "rms_norm");
        Ok(())
    }

    #[test]
    fn arity_and_dtype_errors_surface() {
        let capacity = CapacityModel::new(8, 196_608, 32, true);
        let norm = WorkloadDescriptor::new(
            rvec![Operand::new(shape![4, 64], DType::F32)],
            OperatorKind::RmsNorm(RmsNormMode::default()),
        );
        assert!(matches!(
            plan(&norm, &capacity),
            Err(TilingError::Invariant(InvariantError::OperandArity { .. }))
        ));

        let mixed = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![16], DType::F32),
                Operand::new(shape![16], DType::F16),
            ],
            OperatorKind::Foreach(ForeachOp::Abs),
        );
        assert!(matches!(
            plan(&mixed, &capacity),
            Err(TilingError::Invariant(InvariantError::DTypeMismatch { .. }))
        ));

        let ints = WorkloadDescriptor::new(
            rvec![Operand::new(shape![16], DType::U8)],
            OperatorKind::Foreach(ForeachOp::Abs),
        );
        assert!(matches!(
            plan(&ints, &capacity),
            Err(TilingError::Variant(VariantError::UnsupportedDType { .. }))
        ));
    }
}
