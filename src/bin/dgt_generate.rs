//! dgt-generate: run a cached generation pass over a JSONL file.
//!
//! Usage:
//!   dgt-generate run --config <yaml> --input <jsonl> --output <jsonl> --fields a[,b] --result-field <name>
//!   dgt-generate key --config <yaml> --fields a[,b] --record '<json>'
//!   dgt-generate version

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use dgt_lm::cache::{CacheStore, KeyBuilder, NullStore, SqliteStore};
use dgt_lm::{
    AppConfig, CachingGenerator, GenerationCall, Generator, GeneratorFingerprint,
    GeneratorRegistry, Method, Request,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let outcome = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "key" => cmd_key(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("dgt-generate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"dgt-generate — cached batch generation

USAGE:
    dgt-generate <COMMAND> [OPTIONS]

COMMANDS:
    run      Fill one result field for every record of a JSONL file
    key      Print the cache key a record would receive
    version  Show version information
    help     Show this help message

RUN OPTIONS:
    --config <yaml>          Generator and cache configuration
    --input <jsonl>          One JSON object per line
    --output <jsonl>         Where to write the completed records
    --fields <a[,b]>         Input fields, in order
    --result-field <name>    Field receiving the result
    --method <m>             generate (default) or loglikelihood
    --cache <path>           Override cache.path
    --no-cache               Bypass the cache entirely

KEY OPTIONS:
    --config, --fields, --method as above
    --record <json>          Record to compute the key for

ENVIRONMENT:
    RUST_LOG                 Log filter (default: info)"#
    );
}

/// Value following `name`, if present.
fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn required<'a>(args: &'a [String], name: &str) -> anyhow::Result<&'a str> {
    flag_value(args, name).ok_or_else(|| anyhow!("missing required option {name}"))
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn parse_call(args: &[String], result_slot: &str) -> anyhow::Result<GenerationCall> {
    let fields: Vec<&str> = required(args, "--fields")?
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect();
    let method: Method = flag_value(args, "--method").unwrap_or("generate").parse()?;
    Ok(GenerationCall::new(method, fields, result_slot)?)
}

fn load_config(args: &[String]) -> anyhow::Result<AppConfig> {
    let path = required(args, "--config")?;
    AppConfig::from_file(Path::new(path)).with_context(|| format!("loading {path}"))
}

fn read_requests(path: &Path) -> anyhow::Result<Vec<Request>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    let mut requests = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))?;
        match value {
            serde_json::Value::Object(fields) => requests.push(Request::from_fields(fields)),
            _ => bail!("{}:{}: expected a JSON object", path.display(), n + 1),
        }
    }
    Ok(requests)
}

fn write_records(path: &Path, batch: &[Request]) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path).with_context(|| format!("creating {}", path.display()))?);
    for req in batch {
        serde_json::to_writer(&mut out, &req.to_record())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let call = parse_call(args, required(args, "--result-field")?)?;
    let input = PathBuf::from(required(args, "--input")?);
    let output = PathBuf::from(required(args, "--output")?);

    let backend = GeneratorRegistry::with_builtin().build(&config.generator)?;
    let store: Box<dyn CacheStore> = if has_flag(args, "--no-cache") {
        Box::new(NullStore::new())
    } else if let Some(path) = flag_value(args, "--cache") {
        Box::new(
            SqliteStore::new(path)
                .with_busy_timeout(Duration::from_millis(config.cache.busy_timeout_ms)),
        )
    } else {
        config.cache.build_store()
    };
    let cached = CachingGenerator::with_store(backend, store)?;

    let mut batch = read_requests(&input)?;
    info!(
        generator = %cached.name(),
        store = cached.store_name(),
        records = batch.len(),
        method = %call.method(),
        "starting run"
    );
    cached.execute(&mut batch, &call).await?;
    write_records(&output, &batch)?;

    let stats = cached.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        deduplicated = stats.deduplicated,
        writes = stats.writes,
        hit_ratio = stats.hit_ratio(),
        output = %output.display(),
        "run finished"
    );
    Ok(())
}

fn cmd_key(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let call = parse_call(args, "_")?;
    let record: serde_json::Value =
        serde_json::from_str(required(args, "--record")?).context("--record is not valid JSON")?;
    let serde_json::Value::Object(fields) = record else {
        bail!("--record must be a JSON object");
    };

    let backend = GeneratorRegistry::with_builtin().build(&config.generator)?;
    let fingerprint = GeneratorFingerprint::from_config(&backend.fingerprint_source())?;
    let key = KeyBuilder::new(fingerprint.clone()).build_key(
        call.method(),
        call.field_names(),
        &Request::from_fields(fields),
    )?;
    println!("fingerprint: {fingerprint}");
    println!("key:         {key}");
    Ok(())
}
