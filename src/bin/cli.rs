use std::cell::RefCell;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use ctl::dsl::program::FileImportResolver;
use ctl::dsl::{build_program, check_source};
use ctl::metadata::load_metadata;
use ctl::model::{Record, RecordMetadata, RecordRef};
use ctl::resources::{InMemorySequence, Resources};
use ctl::settings::{load_settings, EngineSettings};
use ctl::transform::{DataErrorHandler, TransformStatus};
use ctl::{
    CompileEnv, CtlError, EntryPointKind, ExecutionContext, ExecutionMode, Transform,
    TransformCompiler,
};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ctl-cli", about = "Check, inspect and run CTL transformations", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Back-end for sources without a `//#CTL2` pragma
    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    /// Register an in-memory sequence under NAME (repeatable)
    #[arg(long = "sequence", global = true, value_name = "NAME")]
    sequences: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file and report diagnostics
    Check {
        file: PathBuf,
        /// Also check the entry points of this transform kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// XML record metadata for `$in` / `$out`
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Print diagnostics as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved syntax tree
    Ast {
        file: PathBuf,
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Print the bytecode listing
    Listing {
        file: PathBuf,
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Run a reformat transform over JSON lines
    Run {
        file: PathBuf,
        #[arg(long)]
        metadata: PathBuf,
        /// JSON lines input, one record per line (stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Input record name (defaults to the first record in the metadata)
        #[arg(long)]
        input_record: Option<String>,
        /// Output record name (defaults to the last record in the metadata)
        #[arg(long)]
        output_record: Option<String>,
    },
    /// Run the global code and print global variables
    Eval {
        file: PathBuf,
        /// Globals to print (all top-level globals when omitted)
        names: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Interpret,
    Compile,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interpret => ExecutionMode::Interpret,
            ModeArg::Compile => ExecutionMode::Compile,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Reformat,
    Denormalize,
    Normalize,
}

impl From<KindArg> for EntryPointKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Reformat => EntryPointKind::Reformat,
            KindArg::Denormalize => EntryPointKind::Denormalize,
            KindArg::Normalize => EntryPointKind::Normalize,
        }
    }
}

// ── Shared setup ─────────────────────────────────────────────────

struct Session {
    settings: EngineSettings,
    mode: ExecutionMode,
    sequences: Vec<String>,
}

impl Session {
    fn context(&self) -> ExecutionContext {
        let resources = self.sequences.iter().fold(Resources::new(), |resources, name| {
            resources.with_sequence(name.clone(), Arc::new(InMemorySequence::default()))
        });
        ExecutionContext::new()
            .with_resources(resources)
            .with_max_call_depth(self.settings.max_call_depth)
    }
}

fn read_source(file: &Path) -> Result<(String, String), CtlError> {
    let source = std::fs::read_to_string(file)?;
    let identifier = file.display().to_string();
    Ok((source, identifier))
}

/// Compile environment with imports resolved next to `file` and every
/// record of `metadata` declared.
fn compile_env(file: &Path, metadata: &[Arc<RecordMetadata>]) -> CompileEnv {
    let base = file.parent().map(Path::to_path_buf).unwrap_or_default();
    let env = CompileEnv::new().with_import_resolver(FileImportResolver::new(base));
    metadata.iter().fold(env, |env, meta| env.with_record_type(meta.clone()))
}

fn read_metadata(path: Option<&Path>) -> Result<Vec<Arc<RecordMetadata>>, CtlError> {
    match path {
        Some(path) => Ok(load_metadata(path)?),
        None => Ok(Vec::new()),
    }
}

fn pick_record(
    metadata: &[Arc<RecordMetadata>],
    name: Option<&str>,
    fallback: Option<&Arc<RecordMetadata>>,
) -> Result<Arc<RecordMetadata>, CtlError> {
    match name {
        Some(name) => metadata
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| CtlError::Usage(format!("No record '{name}' in metadata"))),
        None => fallback
            .cloned()
            .ok_or_else(|| CtlError::Usage("Metadata declares no records".to_string())),
    }
}

fn print_diagnostics(errors: &[ctl::dsl::error::CompileError], source: &str, identifier: &str) {
    for error in errors {
        eprintln!("{}", error.format_with_source(source, identifier));
    }
}

// ── Commands ─────────────────────────────────────────────────────

fn check(
    session: &Session,
    file: &Path,
    kind: Option<KindArg>,
    metadata: Option<&Path>,
    json: bool,
) -> Result<bool, CtlError> {
    let (source, identifier) = read_source(file)?;
    let records = read_metadata(metadata)?;
    let mut env = compile_env(file, &records);
    if let Some(first) = records.first() {
        env = env.with_input(first.clone());
    }
    if let Some(last) = records.last() {
        env = env.with_output(last.clone());
    }

    let errors = match kind {
        Some(kind) => {
            let mut compiler = TransformCompiler::new(env).with_default_mode(session.mode);
            compiler.compile(&source, kind.into(), &identifier)
        }
        None => {
            let mode = ExecutionMode::from_pragma(&source).unwrap_or(session.mode);
            match check_source(&source, &env, mode).and_then(build_program) {
                Ok(_) => Vec::new(),
                Err(errors) => errors,
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&errors)?);
    } else if errors.is_empty() {
        println!("{identifier}: ok");
    } else {
        print_diagnostics(&errors, &source, &identifier);
    }
    Ok(errors.is_empty())
}

fn ast(session: &Session, file: &Path, metadata: Option<&Path>) -> Result<(), CtlError> {
    let (source, identifier) = read_source(file)?;
    let records = read_metadata(metadata)?;
    let env = compile_env(file, &records);
    let mode = ExecutionMode::from_pragma(&source).unwrap_or(session.mode);
    let program = check_source(&source, &env, mode)
        .inspect_err(|errors| print_diagnostics(errors, &source, &identifier))?;
    if let Some(root) = program.ast.root() {
        print!("{}", program.ast.dump(root));
    }
    Ok(())
}

fn listing(file: &Path, metadata: Option<&Path>) -> Result<(), CtlError> {
    let (source, identifier) = read_source(file)?;
    let records = read_metadata(metadata)?;
    let env = compile_env(file, &records);
    let program = check_source(&source, &env, ExecutionMode::Compile)
        .and_then(build_program)
        .inspect_err(|errors| print_diagnostics(errors, &source, &identifier))?;
    if let Some(text) = program.listing() {
        print!("{text}");
    }
    Ok(())
}

struct RunArgs<'a> {
    file: &'a Path,
    metadata: &'a Path,
    input: Option<&'a Path>,
    input_record: Option<&'a str>,
    output_record: Option<&'a str>,
}

fn run(session: &Session, args: &RunArgs<'_>) -> Result<(), CtlError> {
    let (source, identifier) = read_source(args.file)?;
    let records = load_metadata(args.metadata)?;
    let input_meta = pick_record(&records, args.input_record, records.first())?;
    let output_meta = pick_record(&records, args.output_record, records.last())?;
    let env = compile_env(args.file, &records)
        .with_input(input_meta.clone())
        .with_output(output_meta.clone());

    let mut compiler = TransformCompiler::new(env).with_default_mode(session.mode);
    let errors = compiler.compile(&source, EntryPointKind::Reformat, &identifier);
    if !errors.is_empty() {
        print_diagnostics(&errors, &source, &identifier);
        return Err(CtlError::Compile(errors));
    }
    let program = compiler
        .take_program()
        .ok_or_else(|| CtlError::Usage("Compiler produced no program".to_string()))?;

    let mut transform = Transform::new(program, EntryPointKind::Reformat, session.context())?
        .keep_global_scope(session.settings.keep_global_scope);
    if !transform.init()? {
        return Err(CtlError::Usage("init() returned false".to_string()));
    }
    transform.pre_execute()?;

    let reader: Box<dyn BufRead> = match args.input {
        Some(path) => Box::new(BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let input: RecordRef = Rc::new(RefCell::new(Record::new(input_meta)));
    let output: RecordRef = Rc::new(RefCell::new(Record::new(output_meta)));
    let mut handler = DataErrorHandler::new(session.settings.data_error_policy);
    let (mut written, mut dropped) = (0usize, 0usize);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<serde_json::Value>(&line)?;
        if handler.handle(input.borrow_mut().populate_from_json(&parsed))?.is_none() {
            continue;
        }
        output.borrow_mut().reset();
        match transform.transform(&[input.clone()], &[output.clone()])? {
            TransformStatus::Ok(0) => {
                println!("{}", output.borrow().to_json());
                written += 1;
            }
            TransformStatus::Ok(port) => log::warn!("no output port {port}, record dropped"),
            TransformStatus::Skip => dropped += 1,
            TransformStatus::Error(code) => {
                return Err(CtlError::Usage(format!("transform() failed with code {code}")));
            }
        }
    }

    transform.post_execute()?;
    transform.finished()?;
    log::info!(
        "{written} record(s) written, {dropped} skipped by transform, {} rejected",
        handler.skipped()
    );
    Ok(())
}

fn eval(session: &Session, file: &Path, names: &[String]) -> Result<(), CtlError> {
    let (source, identifier) = read_source(file)?;
    let env = compile_env(file, &[]);
    let mode = ExecutionMode::from_pragma(&source).unwrap_or(session.mode);
    let program = check_source(&source, &env, mode)
        .and_then(build_program)
        .inspect_err(|errors| print_diagnostics(errors, &source, &identifier))?;

    let mut ctx = session.context();
    program.run_global(&mut ctx).map_err(|e| CtlError::Usage(e.stack_trace()))?;

    let names: Vec<String> = if names.is_empty() {
        program
            .symbols()
            .globals
            .iter()
            .filter(|g| g.top_level)
            .map(|g| g.name.clone())
            .collect()
    } else {
        names.to_vec()
    };
    for name in names {
        match program.get_variable_value(&ctx, &name) {
            Some(value) => println!("{name} = {value}"),
            None => return Err(CtlError::Usage(format!("No global variable '{name}'"))),
        }
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    let settings = match cli.config.as_deref().map(load_settings).transpose() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();

    let mode = cli.mode.map_or(settings.default_mode, ExecutionMode::from);
    let session = Session {
        settings,
        mode,
        sequences: cli.sequences,
    };

    let result = match &cli.command {
        Commands::Check { file, kind, metadata, json } => {
            check(&session, file, *kind, metadata.as_deref(), *json).map(|ok| {
                if !ok {
                    process::exit(1);
                }
            })
        }
        Commands::Ast { file, metadata } => ast(&session, file, metadata.as_deref()),
        Commands::Listing { file, metadata } => listing(file, metadata.as_deref()),
        Commands::Run { file, metadata, input, input_record, output_record } => run(
            &session,
            &RunArgs {
                file,
                metadata,
                input: input.as_deref(),
                input_record: input_record.as_deref(),
                output_record: output_record.as_deref(),
            },
        ),
        Commands::Eval { file, names } => eval(&session, file, names),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
