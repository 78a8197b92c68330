use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use hydrogen_python::settings::load_settings;
use hydrogen_python::{
    expand, CodeBlock, Editor, ExpansionResult, Executor, HydrogenPython, KernelConnection,
    KernelMessage, LineBuffer, PluginEvent, RunMode, Settings, SingleEditor, SourceBuffer,
    VariableRecord,
};
use log::{info, warn};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

const EXPLORER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Default log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Send the row as-is instead of expanding it to the whole statement
    #[arg(long, global = true)]
    no_expand: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the code region that would run for a row of a file
    Expand {
        /// Python source file
        file: PathBuf,
        /// Zero-based row the code starts on
        #[arg(long)]
        row: usize,
        /// Zero-based cursor row, if it already moved past the block
        #[arg(long)]
        cursor: Option<usize>,
        /// Keep the cursor in place instead of advancing past the region
        #[arg(long)]
        stay: bool,
        /// Output the full expansion result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute the region around a row on a running kernel
    Run {
        /// Kernel connection file
        #[arg(long)]
        connection_file: PathBuf,
        /// Python source file
        file: PathBuf,
        /// Zero-based row the code starts on
        #[arg(long)]
        row: usize,
        /// Print the variable explorer table after execution
        #[arg(long)]
        vars: bool,
    },
}

#[derive(Tabled)]
struct VariableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    type_name: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "VALUE")]
    value: String,
}

impl From<&VariableRecord> for VariableRow {
    fn from(record: &VariableRecord) -> Self {
        let or_dash = |s: &str| {
            if s.is_empty() {
                "-".to_string()
            } else {
                s.to_string()
            }
        };
        VariableRow {
            name: record.name.clone(),
            type_name: or_dash(&record.type_name),
            size: or_dash(&record.size),
            value: or_dash(&record.value),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if cli.no_expand {
        settings.expand_code = false;
    }

    match cli.command {
        Commands::Expand {
            file,
            row,
            cursor,
            stay,
            json,
        } => {
            let mode = if stay { RunMode::Stay } else { RunMode::Advance };
            expand_command(&settings, &file, row, cursor, mode, json)
        }
        Commands::Run {
            connection_file,
            file,
            row,
            vars,
        } => run_command(settings, &connection_file, &file, row, vars).await,
    }
}

fn read_buffer(path: &Path) -> Result<LineBuffer> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(LineBuffer::from_text(&text))
}

fn row_text(buffer: &LineBuffer, row: usize, path: &Path) -> Result<String> {
    buffer
        .line(row)
        .ok_or_else(|| anyhow!("Row {} is past the end of {}", row, path.display()))
}

fn expand_command(
    settings: &Settings,
    path: &Path,
    row: usize,
    cursor: Option<usize>,
    mode: RunMode,
    json: bool,
) -> Result<()> {
    let buffer = read_buffer(path)?;
    let block = CodeBlock::new(row_text(&buffer, row, path)?, row);

    let result = if settings.expand_code {
        expand(&buffer, &block, cursor.unwrap_or(row), &settings.rules(), mode)
    } else {
        ExpansionResult {
            block,
            start_row: row,
            end_row: row,
            next_cursor_row: None,
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.block.code);
    }
    Ok(())
}

async fn run_command(
    settings: Settings,
    connection_file: &Path,
    path: &Path,
    row: usize,
    vars: bool,
) -> Result<()> {
    let buffer = read_buffer(path)?.with_cursor(row, RunMode::Advance);
    let code = row_text(&buffer, row, path)?;
    let buffer = Arc::new(buffer);

    let kernel = Arc::new(KernelConnection::from_connection_file(connection_file).await?);
    let language = kernel.language().clone();

    let plugin = HydrogenPython::new(settings, Arc::new(SingleEditor(Some(buffer.clone()))))?;
    let mut events = plugin.subscribe();
    if vars {
        plugin.show_variable_explorer();
    }

    let middleware = plugin
        .attach(kernel.session_id(), language.clone(), kernel.clone())?
        .ok_or_else(|| anyhow!("{} kernels are not supported", language))?;

    let mut replies = middleware.execute(&code).await?;
    let mut ok = true;
    while let Some(message) = replies.recv().await {
        ok &= print_output(&message);
    }
    info!("Cursor moved to row {}", buffer.cursor_row());

    if vars {
        if tokio::time::timeout(EXPLORER_TIMEOUT, middleware.wait_for_explorer())
            .await
            .is_err()
        {
            warn!("Timed out waiting for the variable explorer");
        }
        let mut latest = None;
        while let Ok(event) = events.try_recv() {
            if let PluginEvent::DidUpdateVars(records) = event {
                latest = Some(records);
            }
        }
        match latest {
            Some(records) if !records.is_empty() => {
                let rows: Vec<VariableRow> = records.iter().map(VariableRow::from).collect();
                let table = Table::new(rows).with(Style::rounded()).to_string();
                println!("{}", table);
            }
            Some(_) => println!("No variables defined."),
            None => eprintln!("Variable explorer unavailable for this kernel."),
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Print user-visible output. Returns false for a failed execute_reply.
fn print_output(message: &KernelMessage) -> bool {
    let content = &message.content;
    match message.msg_type() {
        "stream" => {
            let text = content["text"].as_str().unwrap_or_default();
            if content["name"] == "stderr" {
                eprint!("{}", text);
                let _ = io::stderr().flush();
            } else {
                print!("{}", text);
                let _ = io::stdout().flush();
            }
        }
        "execute_result" => {
            if let Some(text) = content["data"]["text/plain"].as_str() {
                println!("{}", text);
            }
        }
        "error" => {
            eprintln!(
                "{}: {}",
                content["ename"].as_str().unwrap_or_default(),
                content["evalue"].as_str().unwrap_or_default()
            );
            for line in content["traceback"].as_array().into_iter().flatten() {
                eprintln!("{}", line.as_str().unwrap_or_default());
            }
        }
        "execute_reply" => return content["status"] == Value::from("ok"),
        _ => {}
    }
    true
}
