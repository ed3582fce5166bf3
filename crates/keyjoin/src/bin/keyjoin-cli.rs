#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use keyjoin::{
    CancelToken, IndexBacking, IndexRegistry, JoinPolicy, JoinRequest, JoinRunner, OutputTarget,
    ProjectionMode, SourceEntry, TracingProgress,
};

const DEFAULT_OUTPUT_DIR: &str = ".";

#[derive(Debug, Clone, Default)]
struct CliArgs {
    sources: Vec<SourceEntry>,
    request: Option<PathBuf>,
    output: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    backing: Option<IndexBacking>,
    batch_size: Option<usize>,
    strict: bool,
    parallel: bool,
    atomic: bool,
    purge_artifacts: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("keyjoin-cli error: {error}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let policy = build_policy(&args)?;
    let registry = IndexRegistry::new();

    if args.purge_artifacts {
        let removed = registry
            .purge_artifacts(&policy.artifact_dir)
            .map_err(|error| error.to_string())?;
        println!(
            "purged artifacts={removed} dir={}",
            policy.artifact_dir.display()
        );
        if args.sources.is_empty() && args.request.is_none() {
            return Ok(());
        }
    }

    let request = match args.request.as_deref() {
        Some(path) => JoinRequest::from_json_path(path).map_err(|error| error.to_string())?,
        None => JoinRequest::new(args.sources.clone()),
    };
    if request.sources.is_empty() {
        return Err("no sources given; use --source or --request (see --help)".to_owned());
    }

    let target = match (args.output, args.output_dir) {
        (Some(path), _) => OutputTarget::File(path),
        (None, Some(dir)) => OutputTarget::Directory(dir),
        (None, None) => OutputTarget::Directory(PathBuf::from(DEFAULT_OUTPUT_DIR)),
    };

    let cancel = CancelToken::new();
    let outcome = JoinRunner::new(&policy, &registry, &TracingProgress, &cancel)
        .run(&request, &target)
        .map_err(|error| error.to_string())?;

    println!(
        "output={} rows_read={} rows_written={} rows_skipped={} columns={}",
        outcome.output.display(),
        outcome.rows_read,
        outcome.rows_written,
        outcome.rows_skipped,
        outcome.header.len()
    );
    for source in &outcome.participating {
        println!(
            "joined source={} matched_rows={} distinct_keys={} cached={}",
            source.label, source.matched_rows, source.distinct_keys, source.from_cache
        );
    }
    for source in &outcome.skipped {
        println!(
            "skipped source={} path={} reason={}",
            source.label,
            source.path.display(),
            source.reason
        );
    }
    Ok(())
}

fn build_policy(args: &CliArgs) -> Result<JoinPolicy, String> {
    let mut policy = match args.config.as_deref() {
        Some(path) => JoinPolicy::from_json_path(path).map_err(|error| error.to_string())?,
        None => JoinPolicy::default(),
    };
    if let Some(dir) = &args.artifact_dir {
        policy.artifact_dir = dir.clone();
    }
    if let Some(backing) = args.backing {
        policy.backing = backing;
    }
    if let Some(batch_size) = args.batch_size {
        policy.batch_size = batch_size;
    }
    if args.strict {
        policy.projection_mode = ProjectionMode::Strict;
    }
    policy.parallel_builds |= args.parallel;
    policy.atomic_output |= args.atomic;
    policy.validate().map_err(|error| error.to_string())?;
    Ok(policy)
}

fn parse_args() -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--source" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--source requires <label>=<path>".to_owned())?;
                let (label, path) = value
                    .split_once('=')
                    .ok_or_else(|| format!("--source expects <label>=<path>, got {value:?}"))?;
                parsed.sources.push(SourceEntry::new(label, path));
            }
            "--key" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--key requires a column name".to_owned())?;
                last_source(&mut parsed.sources, "--key")?.key_column = Some(value);
            }
            "--columns" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--columns requires a comma-separated list".to_owned())?;
                let columns = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect();
                last_source(&mut parsed.sources, "--columns")?.columns = Some(columns);
            }
            "--request" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--request requires a path".to_owned())?;
                parsed.request = Some(PathBuf::from(value));
            }
            "--output" | "-o" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a path".to_owned())?;
                parsed.output = Some(PathBuf::from(value));
            }
            "--output-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output-dir requires a path".to_owned())?;
                parsed.output_dir = Some(PathBuf::from(value));
            }
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a path".to_owned())?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--artifact-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--artifact-dir requires a path".to_owned())?;
                parsed.artifact_dir = Some(PathBuf::from(value));
            }
            "--backing" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--backing requires memory, stored or auto:<bytes>".to_owned())?;
                parsed.backing = Some(parse_backing(&value)?);
            }
            "--batch-size" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--batch-size requires a number".to_owned())?;
                parsed.batch_size = Some(
                    value
                        .parse()
                        .map_err(|_| format!("--batch-size expects a number, got {value:?}"))?,
                );
            }
            "--strict" => parsed.strict = true,
            "--parallel" => parsed.parallel = true,
            "--atomic" => parsed.atomic = true,
            "--purge-artifacts" => parsed.purge_artifacts = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    if parsed.request.is_some() && !parsed.sources.is_empty() {
        return Err("--request cannot be combined with --source".to_owned());
    }
    Ok(parsed)
}

fn last_source<'a>(
    sources: &'a mut [SourceEntry],
    flag: &str,
) -> Result<&'a mut SourceEntry, String> {
    sources
        .last_mut()
        .ok_or_else(|| format!("{flag} must follow a --source"))
}

fn parse_backing(value: &str) -> Result<IndexBacking, String> {
    match value {
        "memory" => Ok(IndexBacking::Memory),
        "stored" => Ok(IndexBacking::Stored),
        other => other
            .strip_prefix("auto:")
            .and_then(|bytes| bytes.parse().ok())
            .map(|stored_above_bytes| IndexBacking::Auto { stored_above_bytes })
            .ok_or_else(|| format!("unknown backing {other:?}; expected memory, stored or auto:<bytes>")),
    }
}

fn print_help() {
    println!(
        "keyjoin-cli\n\
         Usage:\n\
         \tkeyjoin-cli --source <label>=<path> --key <column> --columns <a,b,...> [--source ...]... [options]\n\
         \tkeyjoin-cli --request <request.json> [options]\n\
         The first source is the primary; every other source is looked up by the primary's key.\n\
         Options:\n\
         \t--source <label>=<path>   add a source (csv, tsv, xlsx, xlsm, xlsb, xls, ods)\n\
         \t--key <column>            join key column of the preceding source\n\
         \t--columns <a,b,...>       columns of the preceding source to write\n\
         \t--request <path>          read sources from a JSON join request\n\
         \t-o, --output <path>       output file\n\
         \t--output-dir <path>       directory for a timestamped merged_*.csv (default: {DEFAULT_OUTPUT_DIR})\n\
         \t--config <path>           JSON join policy file\n\
         \t--artifact-dir <path>     directory for stored index artifacts\n\
         \t--backing <mode>          memory, stored or auto:<bytes>\n\
         \t--batch-size <rows>       rows per flushed batch\n\
         \t--strict                  fail sources whose projected columns are missing\n\
         \t--parallel                build secondary indexes in parallel\n\
         \t--atomic                  write output to a temp file and rename on success\n\
         \t--purge-artifacts         delete stored index artifacts before running\n\
         \t-h, --help                show this help\n\
         Logging follows RUST_LOG (default: info)."
    );
}
