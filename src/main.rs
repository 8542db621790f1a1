mod color;
mod dataset;
mod embedding;
mod error;
mod figure;
mod path;
mod residue;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::color::{parse_color, Colormap};
use crate::figure::OutputConfig;
use crate::path::{PathRequest, PathStyle, ResolveOptions};
use crate::residue::{CategoryOptions, HeatmapOptions};

#[derive(Parser)]
#[command(name = "evolook")]
#[command(about = "Draw evolutionary velocity trajectories and residue score diagnostics.", long_about = None)]
struct Cli {
    /// Directory that named figures are written to.
    #[arg(long = "figdir", value_name = "DIR", default_value = "figures", global = true)]
    figdir: PathBuf,

    /// Pixels per inch for figure sizes given in inches.
    #[arg(long = "dpi", value_name = "N", default_value_t = 100.0, global = true)]
    dpi: f64,

    /// Number of threads to use for parallel operations.
    #[arg(short = 't', long = "threads", value_name = "N", global = true)]
    threads: Option<usize>,

    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Draw a shortest trajectory through the transition graph on an embedding.
    Path(PathArgs),
    /// Render the residue score matrix as a heatmap.
    Heatmap(HeatmapArgs),
    /// Color the embedding by the residue observed at low-scoring positions.
    Categories(CategoryArgs),
}

#[derive(Args)]
struct PathArgs {
    /// Load annotations from this FILE.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Write the figure to this FILE (PNG or SVG based on extension).
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: PathBuf,

    /// Observation indices of a precomputed path, comma separated.
    #[arg(short = 'p', long = "path", value_name = "I,J,..", value_delimiter = ',')]
    path: Option<Vec<usize>>,

    /// Index of the first observation.
    #[arg(short = 's', long = "source", value_name = "N")]
    source: Option<usize>,

    /// Index of the last observation.
    #[arg(short = 'e', long = "target", value_name = "N")]
    target: Option<usize>,

    /// Embedding to draw on (reads X_<BASIS>).
    #[arg(short = 'b', long = "basis", value_name = "BASIS", default_value = "umap")]
    basis: String,

    /// Transition graph prefix (reads <VKEY>_graph and <VKEY>_graph_neg).
    #[arg(long = "vkey", value_name = "VKEY", default_value = "velocity")]
    vkey: String,

    /// Follow transitions in both directions.
    #[arg(long = "undirected")]
    undirected: bool,

    /// Marker area in points squared.
    #[arg(long = "size", value_name = "F", default_value_t = 15.0)]
    size: f64,

    /// Marker fill color.
    #[arg(long = "color", value_name = "COLOR", default_value = "white")]
    color: String,

    /// Color markers by their position along the path with this colormap.
    #[arg(long = "cmap", value_name = "NAME")]
    cmap: Option<String>,

    /// Marker outline color.
    #[arg(long = "edgecolor", value_name = "COLOR", default_value = "black")]
    edgecolor: String,

    /// Line color.
    #[arg(long = "linecolor", value_name = "COLOR", default_value = "#888888")]
    linecolor: String,

    /// Line width in pixels.
    #[arg(long = "linewidth", value_name = "F", default_value_t = 1.0)]
    linewidth: f64,

    /// Draw the whole embedding in grey underneath the path.
    #[arg(long = "background")]
    background: bool,
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("dest").required(true).args(["save", "out"])))]
struct HeatmapArgs {
    /// Load annotations from this FILE.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Keep only positions whose absolute score sum reaches this percentile.
    #[arg(long = "percentile-keep", value_name = "F", default_value_t = 0.0)]
    percentile_keep: f64,

    /// Vocabulary prefix (reads <BASIS>_vocabulary).
    #[arg(short = 'b', long = "basis", value_name = "BASIS", default_value = "onehot")]
    basis: String,

    /// Score matrix key.
    #[arg(short = 'k', long = "key", value_name = "KEY", default_value = "residue_scores")]
    key: String,

    /// Diverging colormap.
    #[arg(long = "cmap", value_name = "NAME", default_value = "RdBu")]
    cmap: String,

    /// Save as evolocity_<NAME> in the figure directory.
    #[arg(long = "save", value_name = "NAME")]
    save: Option<String>,

    /// Write the figure to this FILE instead.
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct CategoryArgs {
    /// Load annotations from this FILE.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Positions to plot, comma separated (default: the lowest-scoring ones).
    #[arg(short = 'p', long = "positions", value_name = "I,J,..", value_delimiter = ',')]
    positions: Option<Vec<usize>>,

    /// How many lowest-scoring positions to plot.
    #[arg(short = 'n', long = "n-plot", value_name = "N", default_value_t = 5)]
    n_plot: usize,

    /// Name used in the output files.
    #[arg(long = "namespace", value_name = "NAME", default_value = "residue_categories")]
    namespace: String,

    /// Count positions along this observation's ungapped sequence.
    #[arg(short = 'r', long = "reference", value_name = "NAME")]
    reference: Option<String>,

    /// Embedding to draw on (reads X_<BASIS>).
    #[arg(short = 'b', long = "basis", value_name = "BASIS", default_value = "umap")]
    basis: String,

    /// Score matrix key.
    #[arg(short = 'k', long = "key", value_name = "KEY", default_value = "residue_scores")]
    key: String,

    /// Vocabulary key for the score columns.
    #[arg(long = "vocab", value_name = "KEY", default_value = "onehot_vocabulary")]
    vocab: String,

    /// Don't log the selected lowest scores.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn run_path(args: &PathArgs, output: &OutputConfig) -> anyhow::Result<()> {
    let dataset = dataset::load_dataset(&args.input)
        .with_context(|| format!("loading {:?}", args.input))?;

    let style = PathStyle {
        size: args.size,
        color: parse_color(&args.color)?,
        cmap: args.cmap.as_deref().map(Colormap::by_name).transpose()?,
        edge_color: parse_color(&args.edgecolor)?,
        line_color: parse_color(&args.linecolor)?,
        line_width: args.linewidth,
    };
    let resolve = ResolveOptions {
        undirected: args.undirected,
    };

    let mut request = PathRequest {
        path: args.path.clone(),
        source: args.source,
        target: args.target,
        basis: args.basis.clone(),
        vkey: args.vkey.clone(),
        resolve,
        style,
    };
    // Resolve before the background so argument errors come first
    let path = request.nodes(&dataset)?;
    request.path = Some(path.clone());

    let background = if args.background {
        Some(embedding::background_figure(&dataset, &args.basis, output)?)
    } else {
        None
    };

    info!("Rendering path...");
    let figure = path::draw_path(&dataset, &request, background, output)?;
    figure
        .save(&args.out)
        .with_context(|| format!("writing {:?}", args.out))?;

    let nodes: Vec<String> = path.iter().map(|n| n.to_string()).collect();
    println!("{}", nodes.join(","));
    Ok(())
}

fn run_heatmap(args: &HeatmapArgs, output: &OutputConfig) -> anyhow::Result<()> {
    let dataset = dataset::load_dataset(&args.input)
        .with_context(|| format!("loading {:?}", args.input))?;
    let opts = HeatmapOptions {
        percentile_keep: args.percentile_keep,
        basis: args.basis.clone(),
        key: args.key.clone(),
        cmap: args.cmap.clone(),
        save: args.save.clone(),
    };

    info!("Rendering heatmap...");
    if let Some(figure) = residue::residue_scores(&dataset, &opts, output)? {
        if let Some(out) = &args.out {
            figure
                .save(out)
                .with_context(|| format!("writing {:?}", out))?;
        }
    }
    Ok(())
}

fn run_categories(args: &CategoryArgs, output: &OutputConfig) -> anyhow::Result<()> {
    let mut dataset = dataset::load_dataset(&args.input)
        .with_context(|| format!("loading {:?}", args.input))?;
    let opts = CategoryOptions {
        positions: args.positions.clone(),
        n_plot: args.n_plot,
        namespace: args.namespace.clone(),
        reference: args.reference.clone(),
        verbose: !args.quiet,
        basis: args.basis.clone(),
        score_key: args.key.clone(),
        vocab_key: args.vocab.clone(),
    };

    info!("Rendering residue categories...");
    let positions = residue::residue_categories(&mut dataset, &opts, output)?;
    let positions: Vec<String> = positions.iter().map(|p| p.to_string()).collect();
    println!("{}", positions.join(","));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring the thread pool")?;
    }

    let output = OutputConfig {
        figdir: cli.figdir.clone(),
        dpi: cli.dpi,
    };

    match &cli.command {
        Command::Path(args) => run_path(args, &output)?,
        Command::Heatmap(args) => run_heatmap(args, &output)?,
        Command::Categories(args) => run_categories(args, &output)?,
    }

    info!("Done.");
    Ok(())
}
