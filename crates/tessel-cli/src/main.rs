use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tessel_attention::{all_kernels, AttentionConfig, AttnDims, Executor, KernelKind};
use tessel_core::Tensor;

#[derive(Parser)]
#[command(
    name = "tessel",
    about = "Benchmark and cross-check the tessel attention kernels",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the available kernels and thread pool
    Info,
    /// Time every kernel over a range of sequence lengths
    Bench {
        /// Sequence lengths to benchmark (comma-separated)
        #[arg(long, default_value = "64,128,256,512")]
        sizes: String,
        /// Attention heads per batch element
        #[arg(long, default_value = "4")]
        heads: usize,
        /// Per-head feature width
        #[arg(long, default_value = "64")]
        head_dim: usize,
        /// Kernel configuration as JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run every kernel on random input and compare against the naive kernel
    Check {
        #[arg(long, default_value = "2")]
        batch: usize,
        #[arg(long, default_value = "4")]
        heads: usize,
        #[arg(long, default_value = "67")]
        seq_len: usize,
        #[arg(long, default_value = "16")]
        head_dim: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Kernel configuration as JSON
        #[arg(long)]
        config: Option<PathBuf>,
        /// Largest acceptable |Δ| against the naive kernel
        #[arg(long, default_value = "1e-4")]
        tolerance: f32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Bench { sizes, heads, head_dim, config } => {
            cmd_bench(&sizes, heads, head_dim, &load_config(config.as_deref())?)
        }
        Commands::Check { batch, heads, seq_len, head_dim, seed, config, tolerance } => cmd_check(
            AttnDims::new(batch, heads, seq_len, head_dim),
            seed,
            &load_config(config.as_deref())?,
            tolerance,
        ),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AttentionConfig> {
    let Some(path) = path else {
        return Ok(AttentionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: AttentionConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

fn random_tensor(rng: &mut StdRng, dims: AttnDims) -> Tensor {
    let data: Vec<f32> = (0..dims.numel()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_f32(&data, &dims.shape())
}

fn cmd_info() -> anyhow::Result<()> {
    println!("tessel v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let exec = Executor::new(&AttentionConfig::default())?;
    println!("\nThreads");
    println!("  parallel:      {}", if exec.is_parallel() { "[x]" } else { "[ ]" });
    println!("  rayon workers: {}", exec.concurrency());

    let defaults = AttentionConfig::default();
    println!("\nKernels");
    let kernels = [
        (KernelKind::Naive, "full N×N scores, row softmax, weighted sum"),
        (KernelKind::Blocked, "naive phases with tiled multiplies"),
        (KernelKind::Fused, "one unit per output row, O(N) scratch"),
        (KernelKind::Flash, "streamed key/query blocks, online normaliser"),
    ];
    for (kind, desc) in kernels {
        println!("  {:<10} {}", kind, desc);
    }

    println!("\nDefaults");
    println!("  block:         {}", defaults.block);
    println!("  key_block:     {}", defaults.key_block);
    println!("  query_block:   {}", defaults.query_block);
    println!("  scale:         {}", defaults.scale);
    println!("  stabilization: {:?}", defaults.stabilization);
    Ok(())
}

fn cmd_bench(sizes_str: &str, heads: usize, head_dim: usize, config: &AttentionConfig) -> anyhow::Result<()> {
    let sizes: Vec<usize> = sizes_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if sizes.is_empty() {
        bail!("no valid sizes in '{}'", sizes_str);
    }

    let kernels = all_kernels(config)?;
    println!("=== Tessel Attention Benchmark ===");
    println!("heads={} d={} block={} bc={} br={}\n",
        heads, head_dim, config.block, config.key_block, config.query_block);

    print!("{:<12}", "SeqLen");
    for kernel in &kernels {
        print!(" {:>14}", format!("{} (ms)", kernel.name()));
    }
    println!(" {:>10}", "Best");
    println!("{}", "-".repeat(12 + 15 * kernels.len() + 11));

    let mut rng = StdRng::seed_from_u64(0);
    for &seq_len in &sizes {
        let dims = AttnDims::new(1, heads, seq_len, head_dim);
        let q = random_tensor(&mut rng, dims);
        let k = random_tensor(&mut rng, dims);
        let v = random_tensor(&mut rng, dims);

        let iters = if seq_len <= 128 { 20 } else if seq_len <= 256 { 5 } else { 2 };

        print!("{:<12}", format!("seq={}", seq_len));
        let mut best = ("", f64::INFINITY);
        for kernel in &kernels {
            // Warmup
            kernel.forward(&q, &k, &v, dims)?;
            let secs = time_it(iters, || {
                kernel.forward(&q, &k, &v, dims)?;
                Ok(())
            })?;
            if secs < best.1 {
                best = (kernel.name(), secs);
            }
            print!(" {:>12.3}ms", secs * 1000.0);
        }
        println!(" {:>10}", best.0);
    }
    Ok(())
}

fn cmd_check(dims: AttnDims, seed: u64, config: &AttentionConfig, tolerance: f32) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let q = random_tensor(&mut rng, dims);
    let k = random_tensor(&mut rng, dims);
    let v = random_tensor(&mut rng, dims);

    println!("=== Cross-check against naive ===");
    println!("{} seed={} tolerance={:e}\n", dims, seed, tolerance);
    println!("{:<10} {:>12} {:>10} {:>8}", "Kernel", "max |Δ|", "Time (ms)", "Status");
    println!("{}", "-".repeat(43));

    let kernels = all_kernels(config)?;
    let mut reference: Option<Tensor> = None;
    let mut failures = Vec::new();
    for kernel in &kernels {
        let start = Instant::now();
        let out = kernel.forward(&q, &k, &v, dims)?;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let diff = match &reference {
            Some(r) => out.max_abs_diff(r)?,
            None => 0.0,
        };
        let ok = diff <= tolerance;
        if !ok {
            failures.push(kernel.name());
        }
        println!("{:<10} {:>12.3e} {:>10.3} {:>8}", kernel.name(), diff, ms, if ok { "ok" } else { "FAIL" });
        if reference.is_none() {
            reference = Some(out);
        }
    }

    if !failures.is_empty() {
        bail!("{} exceeded tolerance {:e}", failures.join(", "), tolerance);
    }
    Ok(())
}

fn time_it(iters: usize, mut f: impl FnMut() -> anyhow::Result<()>) -> anyhow::Result<f64> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}
