// CLI commands for operating a judge deployment
use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use judge_common::bus::{self, StreamEntry};
use judge_common::config::JudgeConfig;
use judge_common::language::{LanguageRecipe, LanguagesFile};
use judge_common::types::{JudgeTaskMessage, ResultMessage, StatusUpdate, TestCase};

pub struct SubmitRequest {
    pub file: PathBuf,
    pub language: String,
    pub submission_id: i64,
    pub problem_id: i64,
    pub user_id: i64,
    pub priority: u8,
    pub cases: Option<PathBuf>,
    pub time_limit: Option<u64>,
    pub memory_limit: Option<u64>,
}

pub struct RecipeArgs {
    pub name: String,
    pub ext: String,
    pub version: String,
    pub compile: Option<String>,
    pub execute: String,
    pub display_name: Option<String>,
    pub executable: String,
    pub time_multiplier: f64,
    pub memory_multiplier: f64,
    pub max_processes: u64,
}

async fn connect(redis_url: Option<&str>) -> Result<(JudgeConfig, ConnectionManager)> {
    let mut config = JudgeConfig::load_default()?;
    if let Some(url) = redis_url {
        config.redis_url = url.to_string();
    }
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid Redis URL")?;
    let conn = client
        .get_connection_manager()
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    Ok((config, conn))
}

/// Build the task message for a source file
pub fn build_message(request: &SubmitRequest, code: String, cases: Option<Vec<TestCase>>) -> Result<JudgeTaskMessage> {
    if code.trim().is_empty() {
        bail!("Source file {} is empty", request.file.display());
    }
    if request.submission_id <= 0 || request.problem_id <= 0 || request.user_id <= 0 {
        bail!("Submission, problem and user ids must be positive");
    }
    Ok(JudgeTaskMessage {
        submission_id: request.submission_id,
        problem_id: request.problem_id,
        user_id: request.user_id,
        language: request.language.clone(),
        code,
        time_limit: request.time_limit,
        memory_limit: request.memory_limit,
        test_cases: cases,
        priority: request.priority,
        created_at: chrono::Utc::now(),
    })
}

/// Put a judge task on the task stream
pub async fn submit(redis_url: Option<&str>, request: SubmitRequest) -> Result<()> {
    let code = fs::read_to_string(&request.file)
        .with_context(|| format!("Failed to read {}", request.file.display()))?;
    let cases = match &request.cases {
        Some(path) => {
            let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let cases: Vec<TestCase> =
                serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
            Some(cases)
        }
        None => None,
    };
    let message = build_message(&request, code, cases)?;

    let (config, mut conn) = connect(redis_url).await?;
    let id = bus::append(
        &mut conn,
        &config.bus.task_stream,
        config.bus.stream_max_len,
        &message.submission_id.to_string(),
        &message,
    )
    .await
    .context("Failed to append judge task")?;

    println!("🚀 Submission {} queued on {} as {}", message.submission_id, config.bus.task_stream, id);
    println!("   Follow it with: judge-cli watch --submission-id {}", message.submission_id);
    Ok(())
}

fn belongs_to(entry: &StreamEntry, submission_id: i64) -> bool {
    entry.key.as_deref() == Some(submission_id.to_string().as_str())
}

fn print_result(result: &ResultMessage) {
    println!(
        "✅ Final result: {} (score {}, {} ms, {} KB)",
        result.status, result.result.score, result.result.time_used, result.result.memory_used
    );
    if !result.compile_info.message.is_empty() {
        println!("   Compiler: {}", result.compile_info.message);
    }
    if let Some(message) = &result.message {
        println!("   Message: {}", message);
    }
    for case in &result.result.test_cases {
        println!(
            "   case {:>3}: {:<22} {:>6} ms {:>8} KB",
            case.case_id,
            case.status.as_str(),
            case.time_used,
            case.memory_used
        );
    }
}

/// Follow status and result streams for one submission
pub async fn watch(redis_url: Option<&str>, submission_id: i64, timeout_secs: u64) -> Result<()> {
    let (config, mut conn) = connect(redis_url).await?;
    let streams = [config.bus.status_stream.as_str(), config.bus.result_stream.as_str()];
    let mut ids = vec!["$".to_string(), "$".to_string()];
    let started = Instant::now();

    println!("👀 Watching submission {}", submission_id);
    while started.elapsed() < Duration::from_secs(timeout_secs) {
        let entries = bus::read_after(&mut conn, &streams, &ids, 1000)
            .await
            .context("Failed to read streams")?;

        if entries.is_empty() {
            // a result published before the first read only shows up in the result store
            if let Some(result) = bus::get_result(&mut conn, submission_id).await? {
                print_result(&result);
                return Ok(());
            }
            continue;
        }

        for entry in entries {
            if let Some(slot) = streams.iter().position(|s| *s == entry.stream) {
                ids[slot] = entry.id.clone();
            }
            if !belongs_to(&entry, submission_id) {
                continue;
            }
            let Some(payload) = entry.payload.as_deref() else {
                continue;
            };
            if entry.stream == config.bus.result_stream {
                let result: ResultMessage = serde_json::from_str(payload).context("Invalid result payload")?;
                print_result(&result);
                return Ok(());
            }
            let update: StatusUpdate = serde_json::from_str(payload).context("Invalid status payload")?;
            println!(
                "⏳ {} case {}/{}",
                update.status, update.progress.current_test_case, update.progress.total_test_cases
            );
        }
    }

    bail!("No final result for submission {} within {}s", submission_id, timeout_secs)
}

/// Print the latest dead letters, newest first
pub async fn dead_letters(redis_url: Option<&str>, count: usize) -> Result<()> {
    let (config, mut conn) = connect(redis_url).await?;
    let entries = bus::tail(&mut conn, &config.bus.dead_letter_stream, count).await?;

    if entries.is_empty() {
        println!("📭 No dead letters on {}", config.bus.dead_letter_stream);
        return Ok(());
    }
    for entry in entries {
        let payload = entry.payload.unwrap_or_default();
        match serde_json::from_str::<judge_common::types::DeadLetter>(&payload) {
            Ok(letter) => println!(
                "{} [{}@{}:{}] {}\n    {}",
                letter.timestamp.to_rfc3339(),
                letter.topic,
                letter.partition,
                letter.offset,
                letter.error,
                letter.original_message
            ),
            Err(_) => println!("{} (unreadable) {}", entry.id, payload),
        }
    }
    Ok(())
}

fn load_languages(path: &Path) -> Result<LanguagesFile> {
    if !path.exists() {
        return Ok(LanguagesFile::default());
    }
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_languages(path: &Path, file: &LanguagesFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(file).context("Failed to serialize languages.json")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Problems with each recipe, in file order; empty when the file is valid
pub fn check_recipes(file: &LanguagesFile) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for recipe in &file.languages {
        if let Err(reason) = recipe.check() {
            problems.push(reason);
        }
        if !seen.insert(recipe.name.as_str()) {
            problems.push(format!("language '{}' is defined more than once", recipe.name));
        }
    }
    problems
}

pub fn list_languages(path: &Path) -> Result<()> {
    let file = load_languages(path)?;
    if file.languages.is_empty() {
        println!("No languages configured in {}", path.display());
        return Ok(());
    }

    println!("{:<10} {:<16} {:<14} {:<6} {:<9} {:>5} {:>5}", "NAME", "DISPLAY", "VERSION", "EXT", "COMPILED", "TIME", "MEM");
    for recipe in &file.languages {
        println!(
            "{:<10} {:<16} {:<14} {:<6} {:<9} {:>5} {:>5}",
            recipe.name,
            recipe.display_name,
            recipe.version,
            recipe.file_extension,
            recipe.is_compiled,
            recipe.time_multiplier,
            recipe.memory_multiplier
        );
    }

    let problems = check_recipes(&file);
    if problems.is_empty() {
        println!("\n✅ {} recipes valid", file.languages.len());
        Ok(())
    } else {
        for problem in &problems {
            println!("❌ {}", problem);
        }
        bail!("{} problem(s) in {}", problems.len(), path.display())
    }
}

pub fn new_recipe(args: RecipeArgs) -> LanguageRecipe {
    let is_compiled = args.compile.is_some();
    LanguageRecipe {
        display_name: args.display_name.unwrap_or_else(|| args.name.clone()),
        name: args.name,
        version: args.version,
        file_extension: args.ext.trim_start_matches('.').to_string(),
        source_file: None,
        executable: args.executable,
        compile_command: args.compile,
        execute_command: args.execute,
        compile_timeout_ms: 10_000,
        time_multiplier: args.time_multiplier,
        memory_multiplier: args.memory_multiplier,
        max_processes: args.max_processes,
        syscall_whitelist: vec![],
        is_compiled,
        // no whitelist yet, so a filter would kill the first syscall
        enable_seccomp: false,
        env: vec![],
    }
}

/// Append a recipe, rejecting invalid ones and duplicates
pub fn push_recipe(file: &mut LanguagesFile, recipe: LanguageRecipe) -> Result<()> {
    if let Err(reason) = recipe.check() {
        bail!("Invalid recipe: {}", reason);
    }
    if file.languages.iter().any(|l| l.name == recipe.name) {
        bail!("Language '{}' already exists in config", recipe.name);
    }
    file.languages.push(recipe);
    Ok(())
}

pub fn add_language(path: &Path, recipe: LanguageRecipe) -> Result<()> {
    println!("🚀 Adding language: {}", recipe.name);

    let mut file = load_languages(path)?;
    let name = recipe.name.clone();
    push_recipe(&mut file, recipe)?;

    println!("📝 Updating {}...", path.display());
    save_languages(path, &file)?;

    println!("✅ Language '{}' added successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Add a syscall whitelist and set enable_seccomp for native code");
    println!("  2. Restart judge workers to load the recipe");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: &str, compile: Option<&str>) -> RecipeArgs {
        RecipeArgs {
            name: name.to_string(),
            ext: ".go".to_string(),
            version: "1.22".to_string(),
            compile: compile.map(str::to_string),
            execute: "./{executable}".to_string(),
            display_name: None,
            executable: "main".to_string(),
            time_multiplier: 1.0,
            memory_multiplier: 1.0,
            max_processes: 8,
        }
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            file: PathBuf::from("main.cpp"),
            language: "cpp".to_string(),
            submission_id: 5,
            problem_id: 2,
            user_id: 1,
            priority: 1,
            cases: None,
            time_limit: Some(1000),
            memory_limit: None,
        }
    }

    #[test]
    fn test_build_message() {
        let message = build_message(&request(), "int main(){}".to_string(), None).unwrap();
        assert_eq!(message.submission_id, 5);
        assert_eq!(message.priority, 1);
        assert_eq!(message.time_limit, Some(1000));

        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("test_cases").is_none());
        assert!(value.get("memory_limit").is_none());

        assert!(build_message(&request(), "  \n".to_string(), None).is_err());
        let mut bad = request();
        bad.problem_id = 0;
        assert!(build_message(&bad, "x".to_string(), None).is_err());
    }

    #[test]
    fn test_new_recipe_defaults() {
        let recipe = new_recipe(args("go", Some("go build -o {executable} {source}")));
        assert_eq!(recipe.file_extension, "go");
        assert_eq!(recipe.display_name, "go");
        assert!(recipe.is_compiled);
        assert!(!recipe.enable_seccomp);

        let script = new_recipe(args("lua", None));
        assert!(!script.is_compiled);
        assert!(script.check().is_ok());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut file = LanguagesFile::default();
        push_recipe(&mut file, new_recipe(args("go", Some("go build -o {executable} {source}")))).unwrap();
        let err = push_recipe(&mut file, new_recipe(args("go", Some("go build")))).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(file.languages.len(), 1);
    }

    #[test]
    fn test_check_reports_duplicates_and_bad_recipes() {
        let mut bad = new_recipe(args("rust", None));
        bad.is_compiled = true;
        let file = LanguagesFile {
            languages: vec![new_recipe(args("lua", None)), new_recipe(args("lua", None)), bad],
        };
        let problems = check_recipes(&file);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("more than once"));
        assert!(problems[1].contains("no compile command"));
    }

    #[test]
    fn test_add_language_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/languages.json");

        add_language(&path, new_recipe(args("lua", None))).unwrap();
        assert!(add_language(&path, new_recipe(args("lua", None))).is_err());

        let file = load_languages(&path).unwrap();
        assert_eq!(file.languages.len(), 1);
        assert!(check_recipes(&file).is_empty());
    }

    #[test]
    fn test_shipped_languages_are_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let file = load_languages(&path).unwrap();
        assert!(!file.languages.is_empty());
        assert_eq!(check_recipes(&file), Vec::<String>::new());
    }

    #[test]
    fn test_entry_ownership() {
        let entry = StreamEntry {
            stream: "status_update".to_string(),
            id: "1-0".to_string(),
            key: Some("42".to_string()),
            payload: None,
        };
        assert!(belongs_to(&entry, 42));
        assert!(!belongs_to(&entry, 4));
    }
}
