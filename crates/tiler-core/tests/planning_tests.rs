#[cfg(test)]
mod tests {
    use test_strategy::{proptest, Arbitrary};
    use tiler::{
        plan, rvec, shape, Approximate, AvgPool3dMode, BufferRequest, BufferSizer, CapacityModel,
        DType, EmbeddingGradMode, ForeachOp, GeluQuantMode, HardwareProfile, InfeasibleError,
        MatmulLayout, MatmulMode, Operand, OperatorKind, PartitionPlanner, PartitionSection,
        PoolFormat, QuantMode, RecordHeader, RmsNormMode, RoundMode, RowCursor, TilingError,
        UnitRange, WorkloadDescriptor, EVEN_SECTION_LEN, HEADER_LEN, MAX_TENSORS,
    };

    fn units(n: usize) -> CapacityModel {
        CapacityModel::new(n, 4096, 32, false)
    }

    fn rms_norm(rows: usize, cols: usize, dtype: DType) -> WorkloadDescriptor {
        WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![rows, cols], dtype),
                Operand::new(shape![cols], dtype),
            ],
            OperatorKind::RmsNorm(RmsNormMode::default()),
        )
    }

    #[test]
    fn hundred_rows_over_eight_units() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let plan = PartitionPlanner::balanced(100, &units(8), 1)?;
        assert_eq!(plan.units_used, 8);
        let ranges = plan.ranges();
        assert_eq!(ranges.iter().filter(|r| r.len() == 13).count(), 4);
        assert_eq!(ranges.iter().filter(|r| r.len() == 12).count(), 4);
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
        assert_eq!(ranges.last().map(|r| r.end), Some(100));
        Ok(())
    }

    #[test]
    fn empty_outer_is_not_an_error() -> anyhow::Result<()> {
        let plan = PartitionPlanner::balanced(0, &units(8), 1)?;
        assert_eq!(plan.units_used, 1);
        assert_eq!(plan.ranges(), vec![UnitRange::new(0, 0)]);
        Ok(())
    }

    #[test]
    fn half_precision_double_buffered_tile() -> anyhow::Result<()> {
        let req = BufferRequest::new(2, 3, true);
        let plan = BufferSizer::closed_form(&req, &units(8))?;
        assert_eq!(plan.inner_tile, 336);
        Ok(())
    }

    #[test]
    fn tiny_budget_is_infeasible() {
        let req = BufferRequest::new(4, 4, true);
        let tiny = CapacityModel::new(8, 64, 32, false);
        assert!(matches!(
            BufferSizer::closed_form(&req, &tiny),
            Err(InfeasibleError::BelowBlock { .. })
        ));
    }

    #[test]
    fn ragged_list_splits_inside_the_long_row() -> anyhow::Result<()> {
        let workload = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![50], DType::F32),
                Operand::new(shape![3], DType::F32),
                Operand::new(shape![200], DType::F32),
            ],
            OperatorKind::Foreach(ForeachOp::AddList),
        );
        let capacity = CapacityModel::new(2, 196_608, 32, true);
        let desc = plan(&workload, &capacity)?;
        let PartitionSection::Ragged(ragged) = &desc.partition else {
            anyhow::bail!("foreach plans are ragged");
        };
        assert_eq!(ragged.spans.len(), 2);
        assert_eq!((ragged.spans[0].len, ragged.spans[1].len), (128, 125));
        assert_eq!(ragged.spans[0].end, RowCursor::new(2, 75));
        assert_eq!(ragged.spans[1].start, RowCursor::new(2, 75));

        let bytes = desc.to_bytes()?;
        let header = RecordHeader::read(&bytes)?;
        assert_eq!(header.units, 2);
        assert_eq!(header.variant, 2);
        let rows = &bytes[HEADER_LEN..HEADER_LEN + 3 * 8];
        assert_eq!(&rows[16..24], &200i64.to_le_bytes());
        let second_slot = HEADER_LEN + MAX_TENSORS * 8 + 20;
        assert_eq!(&bytes[second_slot + 4..second_slot + 12], &75i64.to_le_bytes());
        Ok(())
    }

    #[test]
    fn profile_from_json_plans() -> anyhow::Result<()> {
        let profile = HardwareProfile::from_json(
            r#"{
                "name": "regbase-like",
                "unit_count": 64,
                "scratch_bytes": 262144,
                "reserved_bytes": 8192
            }"#,
        )?;
        let capacity = profile.capacity()?;
        assert_eq!(capacity, HardwareProfile::regbase().capacity()?);

        let desc = plan(&rms_norm(100, 1000, DType::F32), &capacity)?;
        assert_eq!(desc.units_used(), 50);
        assert_eq!(desc.variant.code(), 0);
        assert_eq!(desc.header().units, 50);
        Ok(())
    }

    #[test]
    fn every_family_plans_on_both_presets() -> anyhow::Result<()> {
        let grad = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![512, 256], DType::F16),
                Operand::new(shape![512], DType::I32),
            ],
            OperatorKind::EmbeddingDenseGrad(EmbeddingGradMode::new(4096, -1, false)),
        );
        let gelu = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![32, 4096], DType::BF16),
                Operand::new(shape![4096], DType::F32),
            ],
            OperatorKind::GeluQuant(GeluQuantMode::new(
                Approximate::Tanh,
                QuantMode::Static,
                DType::I8,
                RoundMode::Rint,
                true,
                false,
            )),
        );
        let list = WorkloadDescriptor::new(
            rvec![Operand::new(shape![7, 333], DType::BF16)],
            OperatorKind::Foreach(ForeachOp::Sigmoid),
        );

        let pool = WorkloadDescriptor::new(
            rvec![Operand::new(shape![2, 32, 8, 28, 28], DType::F16)],
            OperatorKind::AvgPool3d(AvgPool3dMode::new(
                [2, 3, 3],
                [2, 2, 2],
                [0, 1, 1],
                true,
                false,
                0,
                PoolFormat::Ncdhw,
            )),
        );
        let matmul = WorkloadDescriptor::new(
            rvec![
                Operand::new(shape![4, 256, 512], DType::F16),
                Operand::new(shape![4, 1024, 512], DType::F16),
                Operand::new(shape![1024], DType::F32),
            ],
            OperatorKind::TransposeBatchMatmul(MatmulMode::new(
                MatmulLayout::BatchFirst,
                true,
                DType::F16,
                true,
                false,
                1,
            )),
        );

        for profile in [HardwareProfile::standard(), HardwareProfile::regbase()] {
            let capacity = profile.capacity()?;
            let families = [&rms_norm(64, 2048, DType::F16), &grad, &gelu, &list, &pool, &matmul];
            for workload in families {
                let desc = plan(workload, &capacity)?;
                assert!(desc.buffer.fits(&capacity), "{} on {}", desc.op, profile.name);
                assert!(desc.units_used() <= capacity.unit_count);
                assert_eq!(desc.to_bytes()?.len(), desc.encoded_len());
            }
        }
        Ok(())
    }

    #[test]
    fn invalid_capacity_never_plans() {
        let zero = CapacityModel::new(0, 196_608, 32, true);
        assert!(matches!(
            plan(&rms_norm(4, 64, DType::F32), &zero),
            Err(TilingError::Config(_))
        ));
    }

    #[derive(Arbitrary, Debug)]
    struct NormProblem {
        #[strategy(0..=300usize)]
        rows: usize,
        #[strategy(1..=20_000usize)]
        cols: usize,
        #[strategy(proptest::sample::select(vec![DType::F16, DType::BF16, DType::F32]))]
        dtype: DType,
        regbase: bool,
    }

    #[proptest(cases = 64)]
    fn identical_inputs_identical_records(prob: NormProblem) {
        let profile = if prob.regbase {
            HardwareProfile::regbase()
        } else {
            HardwareProfile::standard()
        };
        let capacity = profile.capacity().unwrap();
        let workload = rms_norm(prob.rows, prob.cols, prob.dtype);
        match (plan(&workload, &capacity), plan(&workload, &capacity)) {
            (Ok(a), Ok(b)) => {
                assert_eq!(a, b);
                let bytes = a.to_bytes().unwrap();
                assert_eq!(bytes, b.to_bytes().unwrap());
                assert_eq!(bytes.len(), HEADER_LEN + EVEN_SECTION_LEN + 120);
            }
            (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
            _ => panic!("planning is not deterministic"),
        }
    }
}
