use std::fmt::Display;
use std::str::FromStr;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use itertools::Itertools;
use tiler::{
    build_summary_table, build_unit_table, plan, Approximate, AvgPool3dMode, CapacityModel, DType,
    EmbeddingGradMode, ForeachOp, GeluQuantMode, HardwareProfile, MatmulLayout, MatmulMode,
    Operand, OperatorKind, PoolFormat, QuantMode, RVec, RmsNormMode, RoundMode, Shape,
    WorkloadDescriptor,
};

pub fn start_logger(level: log::LevelFilter) {
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();
    match logger {
        Ok(_) => log::info!("Logging initialized."),
        Err(error) => eprintln!("Error initializing logging: {:?}", error),
    }
}

fn parse_enum<T>(s: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse::<T>().map_err(|e| format!("{e}: {s}"))
}

fn parse_shape(s: &str) -> Result<Shape, String> {
    let dims = s
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad shape {s}: {e}"))?;
    Ok(Shape::from(dims))
}

/// `d,h,w` or a single value for all three axes.
fn parse_triple(s: &str) -> Result<[usize; 3], String> {
    let values = s
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad window {s}: {e}"))?;
    match values[..] {
        [v] => Ok([v; 3]),
        [d, h, w] => Ok([d, h, w]),
        _ => Err(format!("expected 1 or 3 values, got {}", values.len())),
    }
}

fn load_capacity(matches: &ArgMatches) -> anyhow::Result<CapacityModel> {
    let name = matches
        .get_one::<String>("profile")
        .context("missing profile")?;
    let profile = match HardwareProfile::preset(name) {
        Some(profile) => profile,
        None => {
            let file = std::fs::File::open(name)
                .with_context(|| format!("{name} is neither a preset nor a readable file"))?;
            HardwareProfile::from_reader(std::io::BufReader::new(file))?
        }
    };
    log::info!("Using profile {}", profile.name);
    Ok(profile.capacity()?)
}

fn dtype(matches: &ArgMatches, id: &str) -> anyhow::Result<DType> {
    matches
        .get_one::<DType>(id)
        .copied()
        .with_context(|| format!("missing --{id}"))
}

fn shape(matches: &ArgMatches, id: &str) -> anyhow::Result<Shape> {
    matches
        .get_one::<Shape>(id)
        .cloned()
        .with_context(|| format!("missing --{id}"))
}

fn foreach_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let op = *matches.get_one::<ForeachOp>("op").context("missing --op")?;
    let dtype = dtype(matches, "dtype")?;
    let operands: RVec<Operand> = matches
        .get_many::<Shape>("shape")
        .context("missing --shape")?
        .map(|s| Operand::new(s.clone(), dtype))
        .collect();
    Ok(WorkloadDescriptor::new(operands, OperatorKind::Foreach(op)))
}

fn rms_norm_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let x = shape(matches, "shape")?;
    let dtype = dtype(matches, "dtype")?;
    let gamma_dtype = matches.get_one::<DType>("gamma-dtype").copied().unwrap_or(dtype);
    let norm_dims = *matches.get_one::<usize>("norm-dims").context("missing --norm-dims")?;
    anyhow::ensure!(
        norm_dims >= 1 && norm_dims <= x.rank(),
        "--norm-dims {norm_dims} does not fit shape {x}"
    );
    let gamma = Shape::from(&x.inner()[x.rank() - norm_dims..]);
    let mode = RmsNormMode {
        gemma: matches.get_flag("gemma"),
        epsilon: *matches.get_one::<f32>("epsilon").context("missing --epsilon")?,
    };
    Ok(WorkloadDescriptor::new(
        [Operand::new(x, dtype), Operand::new(gamma, gamma_dtype)].into_iter().collect(),
        OperatorKind::RmsNorm(mode),
    ))
}

fn embedding_grad_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let grad = Operand::new(shape(matches, "shape")?, dtype(matches, "dtype")?);
    let indices = Operand::new(shape(matches, "indices")?, dtype(matches, "index-dtype")?);
    let mode = EmbeddingGradMode::new(
        *matches.get_one::<usize>("num-weights").context("missing --num-weights")?,
        *matches.get_one::<i64>("padding-idx").context("missing --padding-idx")?,
        matches.get_flag("scale-by-freq"),
    );
    Ok(WorkloadDescriptor::new(
        [grad, indices].into_iter().collect(),
        OperatorKind::EmbeddingDenseGrad(mode),
    ))
}

fn gelu_quant_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let x = Operand::new(shape(matches, "shape")?, dtype(matches, "dtype")?);
    let mut operands: RVec<Operand> = [x].into_iter().collect();
    let scale = matches.get_one::<Shape>("scale").cloned();
    let offset = matches.get_flag("offset");
    anyhow::ensure!(scale.is_some() || !offset, "--offset needs --scale");
    if let Some(scale) = scale.as_ref() {
        let scale_dtype = dtype(matches, "scale-dtype")?;
        operands.push(Operand::new(scale.clone(), scale_dtype));
        if offset {
            operands.push(Operand::new(scale.clone(), scale_dtype));
        }
    }

    let mode = GeluQuantMode::new(
        *matches.get_one::<Approximate>("approximate").context("missing --approximate")?,
        *matches.get_one::<QuantMode>("quant").context("missing --quant")?,
        dtype(matches, "dst")?,
        *matches.get_one::<RoundMode>("round").context("missing --round")?,
        scale.is_some(),
        offset,
    );
    Ok(WorkloadDescriptor::new(operands, OperatorKind::GeluQuant(mode)))
}

fn triple(matches: &ArgMatches, id: &str) -> anyhow::Result<[usize; 3]> {
    matches
        .get_one::<[usize; 3]>(id)
        .copied()
        .with_context(|| format!("missing --{id}"))
}

fn avg_pool3d_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let x = Operand::new(shape(matches, "shape")?, dtype(matches, "dtype")?);
    let kernel = triple(matches, "kernel")?;
    let stride = match matches.get_one::<[usize; 3]>("stride") {
        Some(stride) => *stride,
        None => kernel,
    };
    let mode = AvgPool3dMode::new(
        kernel,
        stride,
        triple(matches, "pad")?,
        matches.get_flag("ceil-mode"),
        !matches.get_flag("exclude-pad"),
        *matches.get_one::<i64>("divisor").context("missing --divisor")?,
        *matches.get_one::<PoolFormat>("format").context("missing --format")?,
    );
    Ok(WorkloadDescriptor::new(
        [x].into_iter().collect(),
        OperatorKind::AvgPool3d(mode),
    ))
}

fn matmul_workload(matches: &ArgMatches) -> anyhow::Result<WorkloadDescriptor> {
    let dtype = dtype(matches, "dtype")?;
    let x1 = shape(matches, "shape")?;
    let x2 = shape(matches, "x2")?;
    let out = matches.get_one::<DType>("out").copied().unwrap_or(dtype);
    let mut operands: RVec<Operand> = [Operand::new(x1, dtype), Operand::new(x2.clone(), dtype)]
        .into_iter()
        .collect();
    let transpose_x2 = matches.get_flag("transpose-x2");
    let n = match (x2.rank(), transpose_x2) {
        (3, true) => x2[1],
        (3, false) => x2[2],
        _ => anyhow::bail!("x2 shape {x2} is not rank 3"),
    };
    let bias = matches.get_one::<DType>("bias").copied();
    if let Some(bias) = bias {
        operands.push(Operand::new(Shape::from(vec![n]), bias));
    }
    let scale = out == DType::I8;
    if scale {
        let batch = x2[0];
        operands.push(Operand::new(Shape::from(vec![batch, n]), DType::F32));
    }
    let mode = MatmulMode::new(
        *matches.get_one::<MatmulLayout>("layout").context("missing --layout")?,
        transpose_x2,
        out,
        bias.is_some(),
        scale,
        *matches.get_one::<usize>("batch-split").context("missing --batch-split")?,
    );
    Ok(WorkloadDescriptor::new(
        operands,
        OperatorKind::TransposeBatchMatmul(mode),
    ))
}

fn hex_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(line, chunk)| {
            let hex = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
            format!("{:08x}  {hex}", line * 16)
        })
        .collect_vec()
}

fn hex_dump(bytes: &[u8]) {
    for line in hex_lines(bytes) {
        println!("{line}");
    }
}

fn run(workload: WorkloadDescriptor, matches: &ArgMatches) -> anyhow::Result<()> {
    let capacity = load_capacity(matches)?;
    let desc = plan(&workload, &capacity)
        .with_context(|| format!("planning {} failed", workload.op.name()))?;
    println!("{}", build_summary_table(&desc));
    println!("{}", build_unit_table(&desc));
    if matches.get_flag("hex") {
        hex_dump(&desc.to_bytes()?);
    }
    Ok(())
}

fn common(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("profile")
            .short('p')
            .long("profile")
            .default_value("standard")
            .help("Hardware profile: `standard`, `regbase` or a path to a JSON profile."),
    )
    .arg(
        Arg::new("dtype")
            .short('d')
            .long("dtype")
            .default_value("f32")
            .value_parser(parse_enum::<DType>)
            .help("Element type of the main operand."),
    )
    .arg(
        Arg::new("hex")
            .long("hex")
            .action(ArgAction::SetTrue)
            .help("Dump the encoded tiling record."),
    )
}

fn shape_arg() -> Arg {
    Arg::new("shape")
        .short('s')
        .long("shape")
        .required(true)
        .value_parser(parse_shape)
        .help("Comma separated dimensions, e.g. `32,4096`.")
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("tiler")
        .about("Tiling and partition planner for accelerator kernels")
        .version("0.1.0")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log planning decisions."),
        )
        .subcommand(
            Command::new("profiles").long_about("Print the built-in hardware profiles as JSON."),
        )
        .subcommand(common(
            Command::new("foreach")
                .long_about("Plan a batched elementwise op over a list of tensors.")
                .arg(
                    Arg::new("op")
                        .short('o')
                        .long("op")
                        .required(true)
                        .value_parser(parse_enum::<ForeachOp>)
                        .help("Foreach op, e.g. `add_list` or `lerp_scalar`."),
                )
                .arg(shape_arg().action(ArgAction::Append).help("One shape per tensor.")),
        ))
        .subcommand(common(
            Command::new("rms-norm")
                .long_about("Plan an RMS normalization over the trailing dimensions.")
                .arg(shape_arg())
                .arg(
                    Arg::new("gamma-dtype")
                        .long("gamma-dtype")
                        .value_parser(parse_enum::<DType>)
                        .help("Weight element type, defaults to --dtype."),
                )
                .arg(
                    Arg::new("norm-dims")
                        .long("norm-dims")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Number of trailing dimensions covered by the weight."),
                )
                .arg(
                    Arg::new("epsilon")
                        .long("epsilon")
                        .default_value("1e-6")
                        .value_parser(value_parser!(f32)),
                )
                .arg(Arg::new("gemma").long("gemma").action(ArgAction::SetTrue)),
        ))
        .subcommand(common(
            Command::new("embedding-grad")
                .long_about("Plan the dense gradient of an embedding lookup.")
                .arg(shape_arg())
                .arg(
                    Arg::new("indices")
                        .short('i')
                        .long("indices")
                        .required(true)
                        .value_parser(parse_shape),
                )
                .arg(
                    Arg::new("index-dtype")
                        .long("index-dtype")
                        .default_value("i64")
                        .value_parser(parse_enum::<DType>),
                )
                .arg(
                    Arg::new("num-weights")
                        .short('w')
                        .long("num-weights")
                        .required(true)
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("padding-idx")
                        .long("padding-idx")
                        .default_value("-1")
                        .allow_hyphen_values(true)
                        .value_parser(value_parser!(i64)),
                )
                .arg(
                    Arg::new("scale-by-freq")
                        .long("scale-by-freq")
                        .action(ArgAction::SetTrue),
                ),
        ))
        .subcommand(common(
            Command::new("gelu-quant")
                .long_about("Plan a fused GELU followed by quantization.")
                .arg(shape_arg())
                .arg(
                    Arg::new("quant")
                        .short('q')
                        .long("quant")
                        .default_value("static")
                        .value_parser(parse_enum::<QuantMode>),
                )
                .arg(
                    Arg::new("approximate")
                        .long("approximate")
                        .default_value("none")
                        .value_parser(parse_enum::<Approximate>),
                )
                .arg(
                    Arg::new("dst")
                        .long("dst")
                        .default_value("i8")
                        .value_parser(parse_enum::<DType>),
                )
                .arg(
                    Arg::new("round")
                        .long("round")
                        .default_value("rint")
                        .value_parser(parse_enum::<RoundMode>),
                )
                .arg(
                    Arg::new("scale")
                        .long("scale")
                        .value_parser(parse_shape)
                        .help("Shape of the scale operand, omitted when there is none."),
                )
                .arg(
                    Arg::new("scale-dtype")
                        .long("scale-dtype")
                        .default_value("f32")
                        .value_parser(parse_enum::<DType>),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .action(ArgAction::SetTrue)
                        .help("Add an offset operand shaped like the scale."),
                ),
        ))
        .subcommand(common(
            Command::new("avg-pool3d")
                .long_about("Plan a 3D average pooling over a rank 5 tensor.")
                .arg(shape_arg())
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("NDHWC")
                        .value_parser(parse_enum::<PoolFormat>),
                )
                .arg(
                    Arg::new("kernel")
                        .short('k')
                        .long("kernel")
                        .required(true)
                        .value_parser(parse_triple)
                        .help("Window as `d,h,w` or one value for every axis."),
                )
                .arg(
                    Arg::new("stride")
                        .long("stride")
                        .value_parser(parse_triple)
                        .help("Defaults to the kernel."),
                )
                .arg(
                    Arg::new("pad")
                        .long("pad")
                        .default_value("0")
                        .value_parser(parse_triple),
                )
                .arg(Arg::new("ceil-mode").long("ceil-mode").action(ArgAction::SetTrue))
                .arg(
                    Arg::new("exclude-pad")
                        .long("exclude-pad")
                        .action(ArgAction::SetTrue)
                        .help("Leave padding out of the divisor."),
                )
                .arg(
                    Arg::new("divisor")
                        .long("divisor")
                        .default_value("0")
                        .value_parser(value_parser!(i64)),
                ),
        ))
        .subcommand(common(
            Command::new("matmul")
                .long_about("Plan a batched matmul with a permuted x1 and optionally transposed x2.")
                .arg(shape_arg().help("Stored x1 shape, `B,M,K` or `M,B,K` per --layout."))
                .arg(
                    Arg::new("x2")
                        .long("x2")
                        .required(true)
                        .value_parser(parse_shape)
                        .help("Stored x2 shape, `B,K,N` or `B,N,K` with --transpose-x2."),
                )
                .arg(
                    Arg::new("layout")
                        .long("layout")
                        .default_value("batch_first")
                        .value_parser(parse_enum::<MatmulLayout>),
                )
                .arg(
                    Arg::new("transpose-x2")
                        .long("transpose-x2")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(parse_enum::<DType>)
                        .help("Output element type, defaults to --dtype. `i8` adds a scale."),
                )
                .arg(
                    Arg::new("bias")
                        .long("bias")
                        .value_parser(parse_enum::<DType>)
                        .help("Element type of a bias over n, omitted when there is none."),
                )
                .arg(
                    Arg::new("batch-split")
                        .long("batch-split")
                        .default_value("1")
                        .value_parser(value_parser!(usize)),
                ),
        ))
        .get_matches();

    let level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    start_logger(level);

    match matches.subcommand() {
        Some(("profiles", _)) => {
            let presets = [HardwareProfile::standard(), HardwareProfile::regbase()];
            println!("{}", serde_json::to_string_pretty(&presets)?);
            Ok(())
        }
        Some(("foreach", m)) => run(foreach_workload(m)?, m),
        Some(("rms-norm", m)) => run(rms_norm_workload(m)?, m),
        Some(("embedding-grad", m)) => run(embedding_grad_workload(m)?, m),
        Some(("gelu-quant", m)) => run(gelu_quant_workload(m)?, m),
        Some(("avg-pool3d", m)) => run(avg_pool3d_workload(m)?, m),
        Some(("matmul", m)) => run(matmul_workload(m)?, m),
        _ => unreachable!("subcommand is required"),
    }
}
