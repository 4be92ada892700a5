// Command line driver for scflow stages. Every stage reads a session file and writes a new one.

use anyhow::{format_err, Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use scflow::aggregate::{sc_aggregate, AggregateParams};
use scflow::cell_cycle::{cell_cycle_from_file, ModuleScoreParams};
use scflow::classify::{run_garnett, train_garnett, MarkerClassifier, TrainParams};
use scflow::clonotype::{annotate_clonotypes, prefix_barcodes, read_clonotypes};
use scflow::config::{run_analysis, AnalysisConfig};
use scflow::differential::{condition_de, DeParams};
use scflow::integrate::{integrate_batches, IntegrationParams};
use scflow::markers::{parse_marker_file, write_garnett, GeneDatabase, MarkerSpec, Species};
use scflow::phate::{attach_phate, plot_phate, run_phate, PhateParams};
use scflow::qc::{load, QcParams};
use scflow::reduce::{reduce_dim, ReduceParams};
use scflow::session::Session;
use scflow::trajectory::{plot_trajectory, run_trajectory, TrajectoryParams};
use scflow_h5::{read_session, write_session};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

fn input_arg() -> Arg {
    Arg::new("INPUT")
        .help("session file to read")
        .required(true)
        .index(1)
        .value_parser(value_parser!(PathBuf))
}

fn output_arg() -> Arg {
    Arg::new("OUTPUT")
        .help("session file to write")
        .short('o')
        .long("out")
        .required(true)
        .value_parser(value_parser!(PathBuf))
}

fn out_dir_arg() -> Arg {
    Arg::new("OUT_DIR")
        .help("Output directory")
        .short('d')
        .long("out_dir")
        .default_value(".")
        .value_parser(value_parser!(PathBuf))
}

fn params_arg(help: &'static str) -> Arg {
    Arg::new("PARAMS")
        .help(help)
        .short('p')
        .long("params")
        .value_parser(value_parser!(PathBuf))
}

fn text_arg(id: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(id).help(help).long(long).required(true)
}

fn path_arg(id: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .help(help)
        .long(long)
        .required(true)
        .value_parser(value_parser!(PathBuf))
}

fn species_arg() -> Arg {
    Arg::new("SPECIES")
        .help("human or mouse")
        .long("species")
        .default_value("human")
}

fn cli() -> Command {
    Command::new("scflow")
        .about("single-cell RNA-seq analysis stages")
        .subcommand_required(true)
        .subcommand(
            Command::new("load")
                .about("Read a 10X matrix directory and apply QC")
                .arg(
                    Arg::new("INPUT")
                        .help("10X matrix directory")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(output_arg())
                .arg(Arg::new("PROJECT").help("sample name").long("project"))
                .arg(params_arg("TOML file with QC thresholds")),
        )
        .subcommand(
            Command::new("reduce")
                .about("Normalize, select features, run PCA, cluster and embed")
                .arg(input_arg())
                .arg(output_arg())
                .arg(params_arg("TOML file with reduction parameters")),
        )
        .subcommand(
            Command::new("integrate")
                .about("Integrate samples by anchors and reduce the result")
                .arg(
                    Arg::new("INPUT")
                        .help("session files, one per sample")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(output_arg())
                .arg(params_arg("TOML file with integration parameters"))
                .arg(
                    Arg::new("REDUCE")
                        .help("TOML file with reduction parameters")
                        .long("reduce")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("phate")
                .about("PHATE embedding with a MAGIC-imputed colouring")
                .arg(input_arg())
                .arg(output_arg())
                .arg(out_dir_arg())
                .arg(params_arg("TOML file with PHATE parameters")),
        )
        .subcommand(
            Command::new("trajectory")
                .about("Fit a principal tree and compute pseudotime")
                .arg(input_arg())
                .arg(output_arg())
                .arg(out_dir_arg())
                .arg(params_arg("TOML file with trajectory parameters")),
        )
        .subcommand(
            Command::new("write-markers")
                .about("Write a TOML marker definition as a marker file")
                .arg(
                    Arg::new("INPUT")
                        .help("TOML file with [[types]] entries")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(output_arg().help("marker file to write")),
        )
        .subcommand(
            Command::new("train")
                .about("Train a marker classifier on a reference session")
                .arg(input_arg())
                .arg(output_arg().help("classifier JSON to write"))
                .arg(path_arg("MARKERS", "markers", "marker file"))
                .arg(species_arg())
                .arg(
                    Arg::new("GENE_DB")
                        .help("one symbol per line; the reference's own symbols when absent")
                        .long("gene_db")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(params_arg("TOML file with training parameters")),
        )
        .subcommand(
            Command::new("classify")
                .about("Assign cell types with a trained classifier")
                .arg(input_arg())
                .arg(output_arg())
                .arg(path_arg("CLASSIFIER", "classifier", "classifier JSON"))
                .arg(
                    Arg::new("CLUSTER_EXTEND")
                        .help("extend assignments to whole clusters")
                        .long("cluster_extend")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("cell-cycle")
                .about("Score S and G2/M modules and assign phases")
                .arg(input_arg())
                .arg(output_arg())
                .arg(path_arg("GENES", "genes", "tab-delimited stage list"))
                .arg(species_arg())
                .arg(params_arg("TOML file with module score parameters")),
        )
        .subcommand(
            Command::new("clonotype")
                .about("Join V(D)J clonotypes onto cells")
                .arg(input_arg())
                .arg(output_arg())
                .arg(path_arg("VDJ", "vdj", "V(D)J output directory"))
                .arg(Arg::new("TAG").help("suffix of the added columns").long("tag"))
                .arg(
                    Arg::new("SAMPLE")
                        .help("sample prefix of merged barcodes the V(D)J library belongs to")
                        .long("sample"),
                ),
        )
        .subcommand(
            Command::new("aggregate")
                .about("Proportions of one annotation within another")
                .arg(input_arg())
                .arg(out_dir_arg())
                .arg(Arg::new("GROUP").help("measured column").long("group"))
                .arg(Arg::new("BY").help("grouping column").long("by")),
        )
        .subcommand(
            Command::new("diffexp")
                .about("Differential expression between two conditions per cell type")
                .arg(input_arg())
                .arg(out_dir_arg())
                .arg(text_arg("CELLTYPE", "celltype", "stratifying column"))
                .arg(text_arg("CONDITION", "condition", "condition column"))
                .arg(text_arg("A", "a", "first condition level"))
                .arg(text_arg("B", "b", "second condition level")),
        )
        .subcommand(
            Command::new("run")
                .about("Run every stage of a TOML analysis config")
                .arg(
                    Arg::new("CONFIG")
                        .help("analysis config")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("OUTPUT")
                        .help("session file to write")
                        .short('o')
                        .long("out")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn path<'a>(m: &'a ArgMatches, id: &str) -> Result<&'a PathBuf, Error> {
    m.get_one::<PathBuf>(id).ok_or_else(|| format_err!("missing argument {}", id))
}

fn text<'a>(m: &'a ArgMatches, id: &str) -> Result<&'a str, Error> {
    m.get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| format_err!("missing argument {}", id))
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Parameters from the file given by `id`, or their defaults.
fn stage_params<T: DeserializeOwned + Default>(m: &ArgMatches, id: &str) -> Result<T, Error> {
    match m.get_one::<PathBuf>(id) {
        Some(p) => read_toml(p),
        None => Ok(T::default()),
    }
}

fn input(m: &ArgMatches) -> Result<Session, Error> {
    read_session(path(m, "INPUT")?)
}

fn output(m: &ArgMatches, session: &Session) -> Result<(), Error> {
    write_session(session, path(m, "OUTPUT")?)
}

fn out_dir(m: &ArgMatches) -> Result<&PathBuf, Error> {
    let dir = path(m, "OUT_DIR")?;
    fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    Ok(dir)
}

fn species(m: &ArgMatches) -> Result<Species, Error> {
    Ok(text(m, "SPECIES")?.parse::<Species>()?)
}

fn sample_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("load", m)) => {
            let mut qc: QcParams = stage_params(m, "PARAMS")?;
            if let Some(project) = m.get_one::<String>("PROJECT") {
                qc.project = project.clone();
            }
            output(m, &load(path(m, "INPUT")?, &qc)?)
        }
        Some(("reduce", m)) => {
            let params: ReduceParams = stage_params(m, "PARAMS")?;
            output(m, &reduce_dim(&input(m)?, &params)?)
        }
        Some(("integrate", m)) => {
            let samples = m
                .get_many::<PathBuf>("INPUT")
                .into_iter()
                .flatten()
                .map(|p| Ok((sample_name(p), read_session(p)?)))
                .collect::<Result<Vec<_>, Error>>()?;
            let params: IntegrationParams = stage_params(m, "PARAMS")?;
            let reduce: ReduceParams = stage_params(m, "REDUCE")?;
            output(m, &integrate_batches(&samples, &params, &reduce)?)
        }
        Some(("phate", m)) => {
            let session = input(m)?;
            let params: PhateParams = stage_params(m, "PARAMS")?;
            let result = run_phate(&session, &params)?;
            plot_phate(&result, params.color_gene.as_deref(), out_dir(m)?.join("phate.png"))?;
            let session = if result.cells.len() == session.num_cells() {
                attach_phate(&session, &result)?
            } else {
                info!("PHATE ran on {} of {} cells; embedding not attached", result.cells.len(), session.num_cells());
                session
            };
            output(m, &session)
        }
        Some(("trajectory", m)) => {
            let params: TrajectoryParams = stage_params(m, "PARAMS")?;
            let (session, trajectory) = run_trajectory(&input(m)?, &params)?;
            plot_trajectory(&trajectory, out_dir(m)?.join("trajectory.png"))?;
            output(m, &session)
        }
        Some(("write-markers", m)) => {
            let spec: MarkerSpec = read_toml(path(m, "INPUT")?)?;
            write_garnett(&spec, path(m, "OUTPUT")?)
        }
        Some(("train", m)) => {
            let reference = input(m)?;
            let markers = parse_marker_file(path(m, "MARKERS")?)?;
            let species = species(m)?;
            let db = match m.get_one::<PathBuf>("GENE_DB") {
                Some(p) => GeneDatabase::from_file(species, p)?,
                None => GeneDatabase::new(species, reference.counts.feature_names.iter().cloned()),
            };
            let params: TrainParams = stage_params(m, "PARAMS")?;
            train_garnett(&reference, &markers, &db, &params)?.save(path(m, "OUTPUT")?)
        }
        Some(("classify", m)) => {
            let classifier = MarkerClassifier::load(path(m, "CLASSIFIER")?)?;
            let session = run_garnett(&input(m)?, &classifier, m.get_flag("CLUSTER_EXTEND"))?;
            output(m, &session)
        }
        Some(("cell-cycle", m)) => {
            let params: ModuleScoreParams = stage_params(m, "PARAMS")?;
            let session = cell_cycle_from_file(&input(m)?, path(m, "GENES")?, species(m)?, &params)?;
            output(m, &session)
        }
        Some(("clonotype", m)) => {
            let tag = m.get_one::<String>("TAG").map_or("", String::as_str);
            let mut calls = read_clonotypes(path(m, "VDJ")?)?;
            if let Some(sample) = m.get_one::<String>("SAMPLE") {
                calls = prefix_barcodes(calls, sample);
            }
            let session = annotate_clonotypes(&input(m)?, &calls, tag)?;
            output(m, &session)
        }
        Some(("aggregate", m)) => {
            let mut params = AggregateParams::default();
            if let Some(g) = m.get_one::<String>("GROUP") {
                params.group = g.clone();
            }
            if let Some(b) = m.get_one::<String>("BY") {
                params.by = b.clone();
            }
            sc_aggregate(&input(m)?, &params, Some(out_dir(m)?))?;
            Ok(())
        }
        Some(("diffexp", m)) => {
            let params = DeParams {
                celltype_col: text(m, "CELLTYPE")?.to_string(),
                condition_col: text(m, "CONDITION")?.to_string(),
                a: text(m, "A")?.to_string(),
                b: text(m, "B")?.to_string(),
            };
            let files = condition_de(&input(m)?, &params, out_dir(m)?)?;
            info!("wrote {} differential expression tables", files.len());
            Ok(())
        }
        Some(("run", m)) => {
            let cfg = AnalysisConfig::from_file(path(m, "CONFIG")?)?;
            let session = run_analysis(&cfg)?;
            let out = match m.get_one::<PathBuf>("OUTPUT") {
                Some(p) => p.clone(),
                None => cfg.output_dir.join("session.h5"),
            };
            write_session(&session, out)
        }
        Some((other, _)) => Err(format_err!("unknown subcommand {}", other)),
        None => Err(format_err!("no subcommand given")),
    }
}
