use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use phylo_common::{
    parse_newick, write_newick, write_nexus, TaxonNamespace, Tree, ULTRAMETRICITY_PRECISION,
};
use taxon_grafting::{
    add_taxa, check_trees, precompute_rates, FastMrca, RunContext, SHORT_BRANCH_THRESHOLD,
};

#[derive(Parser)]
#[clap(name = "taxograft", version, about = "Graft missing taxa onto a dated backbone phylogeny")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add tips onto a backbone phylogeny using a taxonomy phylogeny
    AddTaxa(AddTaxa),
    /// Check a simulated phylogeny for consistency with its backbone and taxonomy
    CheckTrees(CheckTrees),
}

#[derive(Args)]
struct AddTaxa {
    /// Taxonomy tree in newick, rank names on internal nodes
    #[clap(long, value_name = "FILE")]
    taxonomy: PathBuf,

    /// The backbone tree to attach the taxonomy tree to
    #[clap(long, value_name = "FILE")]
    backbone: PathBuf,

    /// Comma separated outgroup taxa to register before reading the backbone
    #[clap(long)]
    outgroups: Option<String>,

    /// Output base name; writes <output>.newick.tre and <output>.nexus.tre
    #[clap(long)]
    output: String,

    /// Minimum probability that a clade's sampled tips span its crown
    #[clap(long, default_value_t = 0.8)]
    min_ccp: f64,

    /// Worker threads for parallel operations (default: all cores)
    #[clap(long)]
    cores: Option<usize>,

    /// Seed for the run's random draws (default: from the clock)
    #[clap(long)]
    seed: Option<u64>,

    /// Emit extra information (can be repeated)
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Send diagnostics to this file instead of standard error
    #[clap(long, value_name = "FILE")]
    log: Option<PathBuf>,
}

#[derive(Args)]
struct CheckTrees {
    /// The simulated tree produced by add-taxa
    #[clap(value_name = "SIMULATED")]
    simulated: PathBuf,

    /// Backbone phylogeny the simulated tree grew from
    #[clap(long, value_name = "FILE")]
    backbone: PathBuf,

    /// Taxonomy phylogeny that guided the growth
    #[clap(long, value_name = "FILE")]
    taxonomy: PathBuf,

    /// Output CSV report (default: standard output)
    #[clap(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Worker threads for parallel operations (default: all cores)
    #[clap(long)]
    cores: Option<usize>,

    /// Number of tree nodes per worker batch
    #[clap(long)]
    chunksize: Option<usize>,

    /// Emit extra information (can be repeated)
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Send diagnostics to this file instead of standard error
    #[clap(long, value_name = "FILE")]
    log: Option<PathBuf>,
}

fn init_logging(verbose: usize, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = log_file {
        builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
    }
    builder.init();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::AddTaxa(args) => run_add_taxa(args),
        Command::CheckTrees(args) => run_check_trees(args),
    };
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn read_tree(path: &Path, ns: &mut TaxonNamespace) -> Result<Tree, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_newick(&text, ns)?)
}

fn run_add_taxa(args: AddTaxa) -> Result<(), Box<dyn Error>> {
    init_logging(args.verbose, args.log.as_deref())?;

    log::info!("reading taxonomy");
    let mut ns = TaxonNamespace::new();
    let taxonomy = read_tree(&args.taxonomy, &mut ns)?;
    if let Some(outgroups) = &args.outgroups {
        for outgroup in outgroups.split(',') {
            ns.require(&outgroup.trim().replace('_', " "))?;
        }
    }
    ns.freeze();

    log::info!("reading tree");
    let mut backbone = read_tree(&args.backbone, &mut ns)?;
    backbone.ages_from_lengths(ULTRAMETRICITY_PRECISION)?;

    let cores = args.cores.unwrap_or_else(num_cpus::get);
    let seed = args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default()
    });
    log::info!("random seed: {seed}");

    // the tuning probes draw from their own stream so that timing noise
    // cannot shift the simulation's random sequence
    let mut tune_rng = Pcg64::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15);
    let mrca = FastMrca::new(&backbone, &ns, cores, None, &mut tune_rng)?;
    log::debug!("mrca index loaded");

    let mut ctx = RunContext::new(mrca, Pcg64::seed_from_u64(seed), args.min_ccp);
    precompute_rates(&ctx.mrca, &taxonomy, &mut backbone, cores)?;
    add_taxa(&mut backbone, &taxonomy, &ns, &mut ctx)?;

    backbone.ladderize();
    for leaf in backbone.leaves(backbone.root()) {
        let edge = backbone.node(leaf).edge_length;
        if edge <= SHORT_BRANCH_THRESHOLD {
            log::info!(
                "warning: taxon {} has extremely short branch ({})",
                backbone.describe(leaf),
                edge
            );
        }
    }

    let mut newick_out = BufWriter::new(File::create(format!("{}.newick.tre", args.output))?);
    write_newick(&backbone, &mut newick_out, true)?;
    newick_out.flush()?;
    let mut nexus_out = BufWriter::new(File::create(format!("{}.nexus.tre", args.output))?);
    write_nexus(&backbone, &mut nexus_out, true)?;
    nexus_out.flush()?;
    Ok(())
}

fn run_check_trees(args: CheckTrees) -> Result<(), Box<dyn Error>> {
    init_logging(args.verbose, args.log.as_deref())?;

    let mut ns = TaxonNamespace::new();
    let taxonomy = read_tree(&args.taxonomy, &mut ns)?;
    log::info!("taxonomy ok");
    let mut backbone = read_tree(&args.backbone, &mut ns)?;
    backbone.ages_from_lengths(ULTRAMETRICITY_PRECISION)?;
    log::info!("backbone ok");
    let mut simulated = read_tree(&args.simulated, &mut ns)?;
    simulated.ages_from_lengths(ULTRAMETRICITY_PRECISION)?;
    log::info!("simulated ok");

    let cores = args.cores.unwrap_or_else(num_cpus::get);
    let rows = check_trees(&taxonomy, &backbone, &simulated, &ns, cores, args.chunksize)?;

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    };
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "node",
        "taxonomy_tips",
        "backbone_tips",
        "simulated_tips",
        "backbone_monophyletic",
        "simulated_monophyletic",
        "backbone_birth",
        "simulated_birth",
        "backbone_death",
        "simulated_death",
        "warnings",
    ])?;
    let fmt_count = |v: Option<usize>| v.map(|n| n.to_string()).unwrap_or_default();
    let fmt_rate = |v: Option<f64>| v.map(|r| r.to_string()).unwrap_or_default();
    for row in rows {
        writer.write_record([
            row.taxon.clone(),
            row.taxonomy_tips.to_string(),
            fmt_count(row.backbone_tips),
            fmt_count(row.simulated_tips),
            row.backbone_monophyletic.to_string(),
            row.simulated_monophyletic.to_string(),
            fmt_rate(row.backbone_birth),
            fmt_rate(row.simulated_birth),
            fmt_rate(row.backbone_death),
            fmt_rate(row.simulated_death),
            row.warnings,
        ])?;
    }
    writer.flush()?;
    Ok(())
}
