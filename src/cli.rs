//! CLI interface for pulumi-rollback.
//!
//! Commands:
//!
//! - `pulumi-rollback list`: deployment history as a table.
//! - `pulumi-rollback preview --version <n>`: what rolling back would change.
//! - `pulumi-rollback to --version <n>`: roll back for real, after confirmation.
//! - `pulumi-rollback version`: build information.
//!
//! The stack comes from `--stack`, then `PULUMI_STACK`, then the config file.
//! `--fixture <file>` swaps the `pulumi` CLI for an in-memory backend loaded
//! from JSON, which is handy for trying the tool without touching a stack.

mod format;

use std::env;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cancel::Cancellation;
use crate::config::{self, Config};
use crate::error::RollbackError;
use crate::history;
use crate::model::{RollbackOutcome, RollbackRequest};
use crate::operator::{MemoryOperator, PulumiOperator, StackOperator};
use crate::rollback::{Plan, Rollback};

use format::{format_change_lines, format_history_table, format_record_details};

/// Roll back Pulumi deployments to previous states.
#[derive(Debug, Parser)]
#[command(name = "pulumi-rollback", after_long_help = WORKFLOW_HELP)]
pub struct Cli {
    /// Name of the Pulumi stack.
    #[arg(short, long, global = true)]
    stack: Option<String>,

    /// Path to the Pulumi project directory.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    cwd: PathBuf,

    /// Enable verbose output and debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use an in-memory backend loaded from this JSON fixture instead of `pulumi`.
    #[arg(long, global = true, value_name = "FILE")]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

const WORKFLOW_HELP: &str = r#"Workflow: rolling back a stack
  1. pulumi-rollback list --stack mystack
     → find the version to go back to (e.g. 5)
  2. pulumi-rollback preview --stack mystack --version 5
  3. pulumi-rollback to --stack mystack --version 5

Preview imports the old state, previews, and always puts the current state back.
`to` imports the old state, refreshes, and runs `up`. If refresh or up fails after
the import, the stack is partially rolled back and the exit code is 2."#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List deployment history for a stack.
    List {
        /// Limit the number of entries to show (0 = all).
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: usize,
    },

    /// Preview changes that would be made by rolling back.
    ///
    /// Makes no lasting changes to the stack.
    Preview {
        /// Target version to roll back to.
        #[arg(short = 'V', long)]
        version: u64,
    },

    /// Roll back to a specific version.
    ///
    /// Restores the stack state to the target version, refreshes to
    /// reconcile with actual infrastructure, then runs `up`.
    To {
        /// Target version to roll back to.
        #[arg(short = 'V', long)]
        version: u64,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the version information.
    Version,
}

/// A failed command: the message for stderr and whether the stack may need
/// manual repair.
#[derive(Debug)]
pub struct CliError {
    message: String,
    needs_intervention: bool,
}

impl CliError {
    fn rollback(context: &str, err: &RollbackError) -> Self {
        Self {
            message: format!("{context}: {err}"),
            needs_intervention: err.needs_intervention(),
        }
    }

    /// Process exit code: 2 when the stack was left partially modified, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        if self.needs_intervention { 2 } else { 1 }
    }
}

impl From<String> for CliError {
    fn from(message: String) -> Self {
        Self {
            message,
            needs_intervention: false,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Run a parsed command line.
pub fn run(cli: &Cli, config: &Config, cancel: &Cancellation) -> Result<(), CliError> {
    if matches!(cli.command, Command::Version) {
        cmd_version();
        return Ok(());
    }

    let stack = config::resolve_stack(
        cli.stack.as_deref(),
        env::var(config::STACK_ENV).ok(),
        config,
    )?;
    let ctx = Context {
        stack,
        cwd: cli.cwd.clone(),
        verbose: cli.verbose,
        cancel: cancel.clone(),
    };

    match &cli.fixture {
        Some(path) => {
            let operator = MemoryOperator::from_fixture(path)?;
            dispatch(&cli.command, &operator, &ctx)
        }
        None => {
            let operator = config
                .pulumi
                .clone()
                .map_or_else(PulumiOperator::default, PulumiOperator::new);
            dispatch(&cli.command, &operator, &ctx)
        }
    }
}

/// Everything a command needs besides its own arguments.
struct Context {
    stack: String,
    cwd: PathBuf,
    verbose: bool,
    cancel: Cancellation,
}

impl Context {
    fn request<'a>(
        &self,
        version: u64,
        dry_run: bool,
        output: &'a mut dyn Write,
    ) -> RollbackRequest<'a> {
        RollbackRequest {
            project_path: self.cwd.clone(),
            stack_name: self.stack.clone(),
            target_version: version,
            dry_run,
            verbose: self.verbose,
            output,
        }
    }
}

fn dispatch<O: StackOperator>(
    command: &Command,
    operator: &O,
    ctx: &Context,
) -> Result<(), CliError> {
    match command {
        Command::List { limit } => cmd_list(operator, ctx, *limit),
        Command::Preview { version } => cmd_preview(operator, ctx, *version),
        Command::To { version, yes } => {
            let stdin = io::stdin();
            cmd_to(operator, ctx, *version, *yes, &mut stdin.lock())
        }
        Command::Version => {
            cmd_version();
            Ok(())
        }
    }
}

fn cmd_list<O: StackOperator>(operator: &O, ctx: &Context, limit: usize) -> Result<(), CliError> {
    if ctx.verbose {
        println!(
            "Fetching history for stack {} in {}...",
            ctx.stack,
            ctx.cwd.display()
        );
    }

    let mut records = history::list_history(operator, &ctx.cwd, &ctx.stack, &ctx.cancel)
        .map_err(|e| CliError::rollback("failed to list history", &e))?;

    if records.is_empty() {
        println!("No deployment history found for this stack.");
        return Ok(());
    }

    if limit > 0 {
        records.truncate(limit);
    }

    print!("{}", format_history_table(&records));
    println!("\nTotal: {} deployment(s)", records.len());
    println!(
        "\nUse 'pulumi-rollback preview --stack {} --version <n>' to preview a rollback",
        ctx.stack
    );
    Ok(())
}

fn cmd_preview<O: StackOperator>(
    operator: &O,
    ctx: &Context,
    version: u64,
) -> Result<(), CliError> {
    let mut stdout = io::stdout();
    let rollback = Rollback::new(operator, ctx.cancel.clone());
    let mut request = ctx.request(version, true, &mut stdout);

    let plan = rollback
        .plan(&request)
        .map_err(|e| CliError::rollback(&format!("failed to find version {version}"), &e))?;
    let Plan::Ready { target, .. } = &plan else {
        // The no-op message goes to the request's output.
        rollback
            .run(plan, &mut request)
            .map_err(|e| CliError::rollback("preview failed", &e))?;
        return Ok(());
    };

    println!("Previewing rollback to version {version}...");
    println!("{}", format_record_details(target));

    let outcome = rollback
        .run(plan, &mut request)
        .map_err(|e| CliError::rollback("preview failed", &e))?;

    print_backend_output(ctx, &outcome);
    println!("\n{}", outcome.message);
    if !outcome.resource_changes.is_empty() {
        print!("\nResource changes:\n{}", format_change_lines(&outcome.resource_changes));
    }
    if !outcome.warnings.is_empty() {
        println!(
            "\nCompleted with {} warning(s); check the stack state with `pulumi stack export`.",
            outcome.warnings.len()
        );
    }

    println!("\nTo execute this rollback, run:");
    println!("  pulumi-rollback to --stack {} --version {version}", ctx.stack);
    Ok(())
}

fn cmd_to<O: StackOperator>(
    operator: &O,
    ctx: &Context,
    version: u64,
    yes: bool,
    input: &mut dyn BufRead,
) -> Result<(), CliError> {
    let mut stdout = io::stdout();
    let rollback = Rollback::new(operator, ctx.cancel.clone());
    let mut request = ctx.request(version, false, &mut stdout);

    let plan = rollback
        .plan(&request)
        .map_err(|e| CliError::rollback(&format!("failed to find version {version}"), &e))?;
    let Plan::Ready { target, latest } = &plan else {
        rollback
            .run(plan, &mut request)
            .map_err(|e| CliError::rollback("rollback failed", &e))?;
        return Ok(());
    };

    println!("Rolling back stack '{}' to version {version}", ctx.stack);
    println!("{}", format_record_details(target));
    println!("⚠️  WARNING: This will modify your infrastructure!");
    println!("   Current version: {latest}");
    println!("   Target version:  {version}");
    println!();

    if !yes && !confirm(input)? {
        println!("Rollback cancelled.");
        return Ok(());
    }

    println!("\nStarting rollback...");

    let outcome = rollback
        .run(plan, &mut request)
        .map_err(|e| CliError::rollback("rollback failed", &e))?;

    print_backend_output(ctx, &outcome);
    println!("\n✓ {}", outcome.message);
    if !outcome.resource_changes.is_empty() {
        print!(
            "\nResource changes applied:\n{}",
            format_change_lines(&outcome.resource_changes)
        );
    }
    Ok(())
}

/// With `--verbose`, echo what the backend printed.
fn print_backend_output(ctx: &Context, outcome: &RollbackOutcome) {
    if !ctx.verbose {
        return;
    }
    if !outcome.stdout.is_empty() {
        print!("\n{}", outcome.stdout);
    }
    if !outcome.stderr.is_empty() {
        eprint!("{}", outcome.stderr);
    }
}

/// Ask for confirmation on stdout and read the answer from `input`.
fn confirm(input: &mut dyn BufRead) -> Result<bool, String> {
    print!("Do you want to proceed? [y/N]: ");
    io::stdout()
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let mut response = String::new();
    input
        .read_line(&mut response)
        .map_err(|e| format!("failed to read response: {e}"))?;

    Ok(is_yes(&response))
}

fn is_yes(response: &str) -> bool {
    matches!(response.trim().to_lowercase().as_str(), "y" | "yes")
}

fn cmd_version() {
    println!("pulumi-rollback {}", env!("CARGO_PKG_VERSION"));
    println!("  Git commit: {}", option_env!("GIT_COMMIT").unwrap_or("unknown"));
    println!("  Build date: {}", option_env!("BUILD_DATE").unwrap_or("unknown"));
}
