use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rayon::prelude::*;

use std::io::{self, Write};
use std::{fs, path};

use mmegeo::common::DataType;
use mmegeo::geoattr::GeoAttr;
use mmegeo::params::{ConvKind, Geometry, LayerParams, MmeStrategy};
use mmegeo::plan::PartitionPlan;
use mmegeo::pprint::{pprint, pprint_sweep};
use mmegeo::target::{Chip, ChipId, Gaudi2, Gaudi2Hal, Gaudi3, Gaudi3Hal, MmeHal};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target chip
    #[arg(long, value_enum, hide_default_value = true, default_value_t = ChipId::default())]
    chip: ChipId,

    /// MME geometry
    #[arg(long, short, value_enum, default_value_t = Geometry::High2x)]
    geometry: Geometry,

    /// Number of MMEs to use. Defaults to every MME on the chip
    #[arg(long)]
    mme_limit: Option<u32>,

    /// Element type of the operands
    #[arg(long, short, value_enum, default_value_t = DataType::Bf16)]
    dtype: DataType,

    #[arg(long, default_value_t = false)]
    no_batch_concurrency: bool,

    #[arg(long, default_value_t = false)]
    no_cd_concurrency: bool,

    #[arg(long, default_value_t = false)]
    dual_gemm: bool,

    /// Plan every symmetric geometry and print one line per plan
    #[arg(long, default_value_t = false)]
    sweep: bool,

    /// Write the plan to this file
    #[arg(long, conflicts_with = "sweep")]
    save: Option<path::PathBuf>,

    #[command(subcommand)]
    op: OpCmd,
}

#[derive(clap::Subcommand)]
enum OpCmd {
    #[command(about = "Plan a matrix multiplication")]
    Gemm {
        m: u32,
        n: u32,
        k: u32,
        #[arg(long, default_value_t = false)]
        transpose_a: bool,
        #[arg(long, default_value_t = false)]
        transpose_b: bool,
    },
    #[command(about = "Plan a batched matrix multiplication")]
    Bgemm {
        m: u32,
        n: u32,
        k: u32,
        #[arg(long, short, default_value = "2")]
        batch: u32,
        /// Use a single B for every batch
        #[arg(long, default_value_t = false)]
        broadcast_b: bool,
    },
    #[command(about = "Plan a convolution or one of its gradients")]
    Conv {
        #[arg(value_enum)]
        kind: ConvKind,
        #[arg(long, short, default_value = "1")]
        batch: u32,
        #[arg(long, default_value = "4")]
        channels: u32,
        #[arg(long, default_value = "8")]
        filters: u32,
        #[arg(long, default_value = "3")]
        filters_size: u32,
        size: u32,
    },
    #[command(about = "Plan a DMA copy")]
    Memcpy { width: u32, height: u32 },
    #[command(about = "Plan a DMA transpose")]
    Transpose { width: u32, height: u32 },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.chip {
        ChipId::Gaudi2 => main_per_chip::<Gaudi2>(&args, &Gaudi2Hal::default()),
        ChipId::Gaudi3 => main_per_chip::<Gaudi3>(&args, &Gaudi3Hal::default()),
    }
}

fn main_per_chip<C: Chip>(args: &Args, hal: &C::Hal) -> Result<()> {
    let mme_limit = args.mme_limit.unwrap_or_else(|| hal.mme_nr());
    let params = layer_params(args);

    if args.sweep {
        let plans = Geometry::SYMMETRIC
            .par_iter()
            .map(|&geometry| {
                let params = params
                    .clone()
                    .with_strategy(strategy(args, geometry, mme_limit));
                plan_for::<C>(&params, hal)
            })
            .collect::<Result<Vec<_>>>()?;
        pprint_sweep(&plans);
        return Ok(());
    }

    let params = params.with_strategy(strategy(args, args.geometry, mme_limit));
    let plan = plan_for::<C>(&params, hal)?;
    pprint(&plan);

    if let Some(path) = &args.save {
        save(&plan, path).with_context(|| format!("Failed to save plan to {}", path.display()))?;
        info!("Saved plan to {}", path.display());
    }
    Ok(())
}

fn plan_for<C: Chip>(params: &LayerParams, hal: &C::Hal) -> Result<PartitionPlan> {
    let geo = GeoAttr::<C>::new(params, hal).with_context(|| {
        format!(
            "Cannot plan {} with geometry {} on {}",
            params.kind,
            params.strategy.geometry,
            C::chip_id()
        )
    })?;
    Ok(geo.plan())
}

fn save(plan: &PartitionPlan, path: &path::Path) -> Result<()> {
    let mut writer = io::BufWriter::new(fs::File::create(path)?);
    plan.save(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn strategy(args: &Args, geometry: Geometry, mme_limit: u32) -> MmeStrategy {
    MmeStrategy {
        geometry,
        mme_limit,
        batch_concurrency: !args.no_batch_concurrency,
        cd_concurrency: !args.no_cd_concurrency,
        dual_gemm: args.dual_gemm,
    }
}

fn layer_params(args: &Args) -> LayerParams {
    let dtype = args.dtype;
    match args.op {
        OpCmd::Gemm {
            m,
            n,
            k,
            transpose_a,
            transpose_b,
        } => LayerParams::gemm(dtype, m, n, k).with_transposed(transpose_a, transpose_b),
        OpCmd::Bgemm {
            m,
            n,
            k,
            batch,
            broadcast_b,
        } => {
            let batch_a = [batch, 1, 1];
            let batch_b = if broadcast_b { [1, 1, 1] } else { batch_a };
            LayerParams::batch_gemm(dtype, m, n, k, batch_a, batch_b)
        }
        OpCmd::Conv {
            kind,
            batch,
            channels,
            filters,
            filters_size,
            size,
        } => LayerParams::conv(kind, dtype, batch, channels, filters, filters_size, size),
        OpCmd::Memcpy { width, height } => LayerParams::memcpy(dtype, width, height),
        OpCmd::Transpose { width, height } => LayerParams::transpose(dtype, width, height),
    }
}
