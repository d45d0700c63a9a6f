use std::{error::Error, fmt::Debug, path::PathBuf, time::Instant};

use clap::{ArgAction, Parser, Subcommand};
use half::f16;
use itertools::Itertools;

pub mod app;
pub mod dispatch;
pub mod format;
pub mod kernel;
pub mod memory;
pub mod num;
pub mod op;
pub mod resource;
pub mod state;
pub mod transfer;

use app::Context;
use format::{Extent, PixelFormat};
use kernel::{KernelSource, Workgroup};
use num::{DataType, Element, Fill};
use op::{ComputeOp, ComputeParams, Operation, Variant};

/// Arrays larger than this are not printed.
const SUMMARY_LIMIT: usize = 2000;

/// Multi-character short flags accepted for compatibility; rewritten to their long form.
const WORKGROUP_FLAGS: [&str; 3] = ["-wx", "-wy", "-wz"];

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
struct Cli {
    /// Problem width.
    #[arg(short = 'w', long, default_value_t = 4, global = true)]
    width: u32,
    /// Problem height.
    #[arg(short = 'h', long, default_value_t = 8, global = true)]
    height: u32,
    /// Workgroup size along x (also `-wx`).
    #[arg(long, default_value_t = 1, global = true)]
    wx: u32,
    /// Workgroup size along y (also `-wy`).
    #[arg(long, default_value_t = 1, global = true)]
    wy: u32,
    /// Workgroup size along z (also `-wz`).
    #[arg(long, default_value_t = 1, global = true)]
    wz: u32,
    /// Directory kernel paths are relative to.
    #[arg(long, default_value = "assets", global = true)]
    assets: PathBuf,
    /// Kernel binary relative to the asset root, instead of the operation's default.
    #[arg(long, global = true)]
    kernel: Option<PathBuf>,
    /// Pixel format of image resources; also selects the element type.
    #[arg(long, value_enum, global = true)]
    format: Option<PixelFormat>,
    /// How input and filter are populated.
    #[arg(long, value_enum, default_value_t = Fill::Sequential, global = true)]
    fill: Fill,
    /// Seed for random fill.
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Measure the dispatch with GPU timestamps.
    #[arg(long, global = true)]
    timestamps: bool,
    /// Print help.
    #[arg(long, action = ArgAction::Help, global = true)]
    help: Option<bool>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Element-wise add over storage buffers.
    Add,
    /// Element-wise add reading storage images and writing a storage buffer.
    AddMixed,
    /// Element-wise add over storage images.
    AddImage,
    /// Valid 2-D convolution.
    Conv2d {
        /// Filter width.
        #[arg(long, default_value_t = 3)]
        filter_w: u32,
        /// Filter height.
        #[arg(long, default_value_t = 3)]
        filter_h: u32,
        /// Resource layout of input, filter and output.
        #[arg(long, value_enum, default_value_t = Variant::Buffer)]
        variant: Variant,
    },
    /// Upload an image and read it back without dispatching.
    CopyImage,
}

impl Command {
    fn default_format(&self) -> PixelFormat {
        match self {
            Command::AddMixed | Command::CopyImage => PixelFormat::R32G32B32A32Float,
            _ => PixelFormat::R32Float,
        }
    }
}

impl Cli {
    fn format(&self) -> PixelFormat {
        self.format.unwrap_or(self.command.default_format())
    }

    fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    fn workgroup(&self) -> Workgroup {
        Workgroup::new(self.wx, self.wy, self.wz)
    }

    /// An unsupported format leaves the path empty; validation refuses it before loading.
    fn kernel(&self, variant: Variant, operation: Operation) -> KernelSource {
        let path = match &self.kernel {
            Some(path) => path.clone(),
            None => variant
                .default_kernel(operation, self.format())
                .map(PathBuf::from)
                .unwrap_or_default(),
        };
        KernelSource::new(&self.assets, path)
    }

    /// Parameters of the dispatching commands; `None` for `copy-image`.
    fn params(&self) -> Option<ComputeParams> {
        let (extent, workgroup, format) = (self.extent(), self.workgroup(), self.format());
        let elementwise = |variant: Variant| {
            let kernel = self.kernel(variant, Operation::Add);
            ComputeParams::elementwise(variant, extent, workgroup, format, kernel)
        };
        let params = match self.command {
            Command::Add => elementwise(Variant::Buffer),
            Command::AddMixed => elementwise(Variant::Mixed),
            Command::AddImage => elementwise(Variant::Image),
            Command::Conv2d {
                filter_w,
                filter_h,
                variant,
            } => {
                let kernel = self.kernel(variant, Operation::Conv2d);
                let filter = Extent::new(filter_w, filter_h);
                ComputeParams::convolution(variant, extent, filter, workgroup, format, kernel)
            }
            Command::CopyImage => return None,
        };
        Some(params.with_timestamps(self.timestamps))
    }
}

/// Rewrites `-wx 4` style flags to `--wx 4`.
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            let flag = arg.split('=').next().unwrap_or_default();
            match WORKGROUP_FLAGS.contains(&flag) {
                true => format!("-{arg}"),
                false => arg,
            }
        })
        .collect()
}

fn format_matrix<T: Debug>(data: &[T], extent: Extent) -> String {
    data.chunks(extent.width.max(1) as usize)
        .map(|row| row.iter().map(|x| format!("{x:?}")).join(" "))
        .join("\n")
}

fn print_summary<T: Debug>(name: &str, data: &[T], extent: Extent) {
    if data.len() >= SUMMARY_LIMIT {
        return;
    }
    println!("{name} ({extent}):");
    println!("{}", format_matrix(data, extent));
}

fn init() -> Result<(), Box<dyn Error>> {
    use simplelog::{ColorChoice, CombinedLogger, LevelFilter, TermLogger, WriteLogger};

    std::fs::create_dir_all("logs")?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("logs/vk_dispatch_{}.log", timestamp);
    let file = std::fs::File::create(&filename)?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Debug,
            Default::default(),
            Default::default(),
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Default::default(), file),
    ])?;

    fastrand::seed(514);

    Ok(())
}

fn run<T: Element>(cli: &Cli, context: &Context) -> Result<(), Box<dyn Error>> {
    let extent = cli.extent();
    let start = Instant::now();

    let Some(params) = cli.params() else {
        let data: Vec<T> = cli.fill.generate(extent.len());
        print_summary("input", &data, extent);
        let output = op::copy_image(context, &data, extent, cli.format())?;
        log::info!("execute: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);
        print_summary("output", &output, extent);
        return Ok(());
    };

    let input: Vec<T> = cli.fill.generate(params.input.len());
    let filter: Vec<T> = cli.fill.generate(params.filter.len());
    print_summary("input", &input, params.input);
    print_summary("filter", &filter, params.filter);

    let op = ComputeOp::new(context, params);
    let output = op.execute(&input, &filter)?;
    log::info!("execute: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);

    print_summary("output", &output.data, output.extent);
    if let Some(ms) = output.dispatch_ms {
        println!("dispatch: {ms:.4} ms");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    init()?;

    let cli = Cli::parse_from(normalize_args(std::env::args()));
    if let Some(seed) = cli.seed {
        fastrand::seed(seed);
    }
    let context = Context::new()?;
    println!("device: {}", context.properties.device_name);

    match cli.format().element() {
        DataType::F16 => run::<f16>(&cli, &context),
        DataType::F32 => run::<f32>(&cli, &context),
        DataType::I32 => run::<i32>(&cli, &context),
        DataType::U32 => run::<u32>(&cli, &context),
    }
}
