mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "judge-cli")]
#[command(about = "Judge CLI - Submit tasks, follow results and manage language recipes", long_about = None)]
struct Cli {
    /// Redis URL (overrides the judge config)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a judge task on the task stream
    Submit {
        /// Source file to judge
        #[arg(short, long)]
        file: PathBuf,

        /// Language name from languages.json
        #[arg(short, long)]
        language: String,

        #[arg(long)]
        submission_id: i64,

        #[arg(long)]
        problem_id: i64,

        #[arg(long, default_value = "1")]
        user_id: i64,

        /// 1 (contest) to 3 (normal)
        #[arg(long, default_value = "3")]
        priority: u8,

        /// JSON file with test cases; with limits it skips the problem service
        #[arg(long)]
        cases: Option<PathBuf>,

        /// Time limit in ms
        #[arg(long)]
        time_limit: Option<u64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_limit: Option<u64>,
    },

    /// Follow status updates of a submission until its final result
    Watch {
        #[arg(long)]
        submission_id: i64,

        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Show the latest dead letters
    DeadLetters {
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// List and validate language recipes
    Languages {
        #[arg(short, long, default_value = "config/languages.json")]
        path: PathBuf,
    },

    /// Add a language recipe to languages.json
    AddLang {
        /// Language name (e.g., go, rust, kotlin)
        #[arg(short, long)]
        name: String,

        /// File extension (e.g., go, rs)
        #[arg(short, long)]
        ext: String,

        /// Toolchain version shown in results
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Compile command with {source}/{executable} placeholders; omit for interpreted languages
        #[arg(short, long)]
        compile: Option<String>,

        /// Execute command with {source}/{executable}/{memory_limit} placeholders
        #[arg(short = 'x', long)]
        execute: String,

        #[arg(long)]
        display_name: Option<String>,

        /// Build product name
        #[arg(long, default_value = "main")]
        executable: String,

        #[arg(long, default_value = "1.0")]
        time_multiplier: f64,

        #[arg(long, default_value = "1.0")]
        memory_multiplier: f64,

        #[arg(long, default_value = "1")]
        max_processes: u64,

        #[arg(long, default_value = "config/languages.json")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let redis_url = cli.redis_url;

    match cli.command {
        Commands::Submit {
            file,
            language,
            submission_id,
            problem_id,
            user_id,
            priority,
            cases,
            time_limit,
            memory_limit,
        } => {
            let request = commands::SubmitRequest {
                file,
                language,
                submission_id,
                problem_id,
                user_id,
                priority,
                cases,
                time_limit,
                memory_limit,
            };
            commands::submit(redis_url.as_deref(), request).await?;
        }
        Commands::Watch { submission_id, timeout } => {
            commands::watch(redis_url.as_deref(), submission_id, timeout).await?;
        }
        Commands::DeadLetters { count } => {
            commands::dead_letters(redis_url.as_deref(), count).await?;
        }
        Commands::Languages { path } => {
            commands::list_languages(&path)?;
        }
        Commands::AddLang {
            name,
            ext,
            version,
            compile,
            execute,
            display_name,
            executable,
            time_multiplier,
            memory_multiplier,
            max_processes,
            path,
        } => {
            let recipe = commands::new_recipe(commands::RecipeArgs {
                name,
                ext,
                version,
                compile,
                execute,
                display_name,
                executable,
                time_multiplier,
                memory_multiplier,
                max_processes,
            });
            commands::add_language(&path, recipe)?;
        }
    }

    Ok(())
}
