use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use ticketflow::{
    BpmnEmitter, CompileError, CompileOptions, CompiledDiagram, DefinitionCompiler, DiagramCompiler, DiagramKind,
    ErrorCode, KeywordTables, KrokiRenderer, RenderError, WorkflowBuilder, WorkflowError, tickets_from_value,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("invalid JSON input: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl CliError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "E_IO",
            Self::Workflow(e) => e.error_code(),
            Self::Compile(e) => e.error_code(),
            Self::Render(e) => e.error_code(),
            Self::InvalidJson(_) => "E_JSON_PARSE",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ticketflow", about = "Infer workflows from tickets and compile them to BPMN and Mermaid")]
struct Cli {
    /// YAML keyword table overriding the built-in vocabulary.
    #[arg(long, global = true, env = "TICKETFLOW_KEYWORDS")]
    keywords: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the inferred workflow as JSON.
    Analyze(InputArgs),
    /// Print BPMN 2.0 XML.
    Bpmn(BpmnArgs),
    /// Print the Mermaid flowchart definition.
    Definition(InputArgs),
    /// Compile and render through the configured renderer, writing artifacts.
    Render(RenderArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    #[arg(default_value = "-", help = "Tickets JSON file, or - for stdin")]
    input: String,
}

#[derive(Args, Debug)]
struct BpmnArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Treat the input as exported workflow JSON instead of tickets.
    #[arg(long, default_value_t = false)]
    workflow: bool,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    input: InputArgs,

    #[arg(long = "type", default_value = "bpmn")]
    kind: String,

    #[arg(long = "format", default_values_t = vec!["svg".to_owned()])]
    formats: Vec<String>,

    #[arg(long)]
    diagram_id: Option<String>,

    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Treat the input as a ready-made Mermaid definition.
    #[arg(long, default_value_t = false)]
    definition: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error [{}]: {error}", error.code());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let builder = WorkflowBuilder::new(load_keywords(cli.keywords.as_deref())?)?;

    match cli.command {
        Command::Analyze(args) => {
            let tickets = tickets_from_value(&read_json(&args.input)?)?;
            let workflow = builder.analyze_workflow(&tickets);
            print_json(&serde_json::to_value(&workflow)?)
        }
        Command::Bpmn(args) => {
            let value = read_json(&args.input.input)?;
            let xml = if args.workflow {
                BpmnEmitter::new().generate_from_value(&value)?
            } else {
                BpmnEmitter::new().generate_bpmn_xml(&builder.analyze_value(&value)?)
            };
            println!("{xml}");
            Ok(())
        }
        Command::Definition(args) => {
            let tickets = tickets_from_value(&read_json(&args.input)?)?;
            println!("{}", DefinitionCompiler::new(builder).build_definition(&tickets, None));
            Ok(())
        }
        Command::Render(args) => run_render(builder, args).await,
    }
}

async fn run_render(builder: WorkflowBuilder, args: RenderArgs) -> Result<(), CliError> {
    let renderer = Arc::new(KrokiRenderer::from_env()?);
    tracing::info!(base_url = renderer.base_url(), "renderer configured");
    let compiler = DiagramCompiler::with_builder(builder, renderer);

    let diagram = if args.definition {
        let definition = read_input(&args.input.input)?;
        compiler
            .render_definition(&definition, &args.formats, args.diagram_id.as_deref())
            .await?
    } else {
        let options = CompileOptions {
            kind: args.kind,
            formats: args.formats,
            diagram_id: args.diagram_id,
            ..CompileOptions::default()
        };
        compiler
            .generate_from_value(&read_json(&args.input.input)?, &options)
            .await?
    };

    write_artifacts(&diagram, &args.out_dir)?;
    print_json(&serde_json::to_value(&diagram)?)
}

fn write_artifacts(diagram: &CompiledDiagram, out_dir: &Path) -> Result<(), CliError> {
    fs::create_dir_all(out_dir).map_err(|e| CliError::io(format!("create {}", out_dir.display()), e))?;

    let xml_extension = match diagram.kind {
        DiagramKind::Bpmn => "bpmn",
        DiagramKind::Mermaid => "xml",
    };
    let artifacts: [(&str, Option<&[u8]>); 4] = [
        ("mmd", Some(diagram.definition.as_bytes())),
        ("svg", diagram.svg.as_deref().map(str::as_bytes)),
        ("png", diagram.png.as_deref()),
        (xml_extension, diagram.xml.as_deref().map(str::as_bytes)),
    ];

    for (extension, contents) in artifacts {
        let Some(contents) = contents else {
            continue;
        };
        let path = out_dir.join(format!("{}.{extension}", diagram.id));
        fs::write(&path, contents).map_err(|e| CliError::io(format!("write {}", path.display()), e))?;
        tracing::info!(path = %path.display(), bytes = contents.len(), "artifact written");
    }
    Ok(())
}

fn load_keywords(path: Option<&Path>) -> Result<KeywordTables, CliError> {
    let Some(path) = path else {
        return Ok(KeywordTables::default());
    };
    let text = fs::read_to_string(path).map_err(|e| CliError::io(format!("read {}", path.display()), e))?;
    Ok(KeywordTables::from_yaml_str(&text)?)
}

fn read_input(input: &str) -> Result<String, CliError> {
    if input == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| CliError::io("read stdin", e))?;
        return Ok(text);
    }
    fs::read_to_string(input).map_err(|e| CliError::io(format!("read {input}"), e))
}

fn read_json(input: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str(&read_input(input)?)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
