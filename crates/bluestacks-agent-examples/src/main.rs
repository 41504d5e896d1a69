//! Command-line driver for the BlueStacks agent client.
//!
//! Reads `BLUESTACKS_AGENT_*` settings from the environment (and `.env`).

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use bluestacks_agent::prelude::*;
use bluestacks_agent::init_observability;
use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser, Debug)]
#[command(version, about = "Drive the BlueStacks automation agent", long_about = None)]
struct Cli {
    /// Helper service URL (overrides discovery and BLUESTACKS_AGENT_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Disable the built-in console printers and stdin prompt
    #[arg(long, global = true)]
    quiet: bool,

    /// Return the device to its home screen when done
    #[arg(long, global = true)]
    go_home: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single task and print its result
    Run {
        #[arg(value_name = "QUERY")]
        query: String,
    },
    /// Run a task, then keep resuming it with lines read from stdin
    Chat {
        #[arg(value_name = "QUERY")]
        query: String,
    },
    Home,
    Back,
    Tap {
        x: i32,
        y: i32,
    },
    Swipe {
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        #[arg(long, default_value_t = 300)]
        duration_ms: u32,
    },
    /// Type text into the focused field
    Text {
        text: String,
    },
    /// Send an Android keycode
    Key {
        keycode: i32,
    },
    /// Launch an app by package name
    App {
        package: String,
        #[arg(long)]
        activity: Option<String>,
    },
    Screenshot {
        #[arg(short, long, default_value = "screenshot.png")]
        out: PathBuf,
    },
    /// Dump the UI hierarchy
    UiTree {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    Feedback {
        message: String,
        #[arg(long, default_value_t = 5)]
        rating: i32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let config = AgentConfig::from_env();
    init_observability(&config.log);

    let cli = Cli::parse();
    match run(cli, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(code = e.code(), "{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, mut config: AgentConfig) -> Result<bool, AgentError> {
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if cli.quiet {
        config.use_default_callbacks = false;
    }
    let client = AgentClient::new(config)?;

    let outcome = match cli.command {
        Commands::Run { query } => Ok(report(&client.run_task(&query).await)),
        Commands::Chat { query } => chat(&client, &query).await,
        Commands::Home => Ok(report(&client.home().await)),
        Commands::Back => Ok(report(&client.back().await)),
        Commands::Tap { x, y } => Ok(report(&client.tap(x, y).await)),
        Commands::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration_ms,
        } => Ok(report(
            &client
                .swipe((start_x, start_y), (end_x, end_y), duration_ms)
                .await,
        )),
        Commands::Text { text } => Ok(report(&client.input_text(&text).await)),
        Commands::Key { keycode } => Ok(report(&client.press_key(keycode).await)),
        Commands::App { package, activity } => Ok(report(
            &client.start_app(&package, activity.as_deref()).await,
        )),
        Commands::Screenshot { out } => client.screenshot(Some(&out)).await.map(|png| {
            println!("{} bytes written to {}", png.len(), out.display());
            true
        }),
        Commands::UiTree { out } => client.ui_tree(out.as_deref()).await.map(|dump| {
            if out.is_none() {
                println!("{dump}");
            }
            true
        }),
        Commands::Feedback { message, rating } => {
            client.send_feedback(&message, rating).await.map(|reply| {
                println!("{reply}");
                true
            })
        }
    };

    client.close(cli.go_home).await;
    outcome
}

async fn chat(client: &AgentClient, query: &str) -> Result<bool, AgentError> {
    let mut result = client.run_task(query).await;
    loop {
        report(&result);
        let Some(line) = read_reply().await? else {
            return Ok(result.success);
        };
        result = client.resume_task(&line).await;
    }
}

/// Next operator line, read on the blocking pool. `None` on EOF or an empty line.
async fn read_reply() -> io::Result<Option<String>> {
    tokio::task::spawn_blocking(|| next_reply(&mut io::stdin().lock(), &mut io::stdout()))
        .await
        .map_err(io::Error::other)?
}

fn next_reply(input: &mut impl BufRead, output: &mut impl Write) -> io::Result<Option<String>> {
    write!(output, "you (empty line to quit)> ")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

fn report(result: &RunResult) -> bool {
    match serde_json::to_string_pretty(result) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{result:?}"),
    }
    result.success
}
