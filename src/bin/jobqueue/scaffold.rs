//! Developer scaffolding: source templates for jobs, events and listeners,
//! and new entries in the queue configuration file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use clap::Subcommand;
use jobqueue::QueueConfig;
use jobqueue::RateLimit;
use jobqueue::config::{append_queue, load_queues};

#[derive(Debug, Subcommand)]
pub enum MakeCommand {
    /// Create a job and register it in src/jobs/mod.rs
    Job {
        /// Job name in PascalCase; "Job" is appended if missing
        name: String,

        /// Queue the job is dispatched to
        #[arg(long)]
        queue: Option<String>,

        /// Maximum number of attempts
        #[arg(long)]
        retries: Option<u32>,

        /// Per-attempt timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// Default dispatch delay in milliseconds
        #[arg(long, value_name = "MS")]
        delay: Option<u64>,
    },
    /// Add a queue to the queue configuration file
    Queue {
        /// Queue name in kebab-case
        name: String,

        /// Maximum number of jobs running at once
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Rate limit, e.g. 10:60000
        #[arg(long, value_name = "MAX:MS", value_parser = parse_rate)]
        rate: Option<RateLimit>,
    },
    /// Create a domain event
    Event {
        /// Event name in PascalCase
        name: String,
    },
    /// Create a listener for an event, creating the event if needed
    Listener {
        /// Event name in PascalCase
        event: String,

        /// Listener name in PascalCase
        listener: String,
    },
}

/// Where the scaffolding writes to.
#[derive(Debug)]
pub struct Project {
    pub src: PathBuf,
    pub queues: PathBuf,
}

fn parse_rate(value: &str) -> Result<RateLimit, String> {
    let parsed = value
        .split_once(':')
        .and_then(|(max, ms)| Some((max.parse::<u32>().ok()?, ms.parse::<u64>().ok()?)));
    match parsed {
        Some((max, ms)) if max > 0 && ms > 0 => Ok(RateLimit::new(max, Duration::from_millis(ms))),
        _ => Err("expected <max>:<durationMs> with positive integers, e.g. 10:60000".into()),
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut previous: Option<char> = None;
    for c in name.chars() {
        if c.is_ascii_uppercase()
            && previous.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
        previous = Some(c);
    }
    out
}

fn ensure_pascal_case(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric());
    ensure!(valid, "{kind} name must be PascalCase (e.g. UserRegistered), got {name:?}");
    Ok(())
}

fn is_kebab_case(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Write `contents` to a new file, refusing to overwrite.
fn create_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
            bail!("file already exists: {}", path.display())
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to create {}", path.display()));
        }
    };
    file.write_all(contents.as_bytes())?;
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Insert `pub mod {module};` after the last module declaration.
fn add_module(source: &str, module: &str) -> String {
    let line = format!("pub mod {module};\n");
    if source.lines().any(|existing| existing.trim() == line.trim()) {
        return source.to_string();
    }

    let mut result = source.to_string();
    match source.rfind("pub mod ") {
        Some(start) => {
            let end = source[start..]
                .find('\n')
                .map_or(source.len(), |offset| start + offset + 1);
            result.insert_str(end, &line);
        }
        None => {
            if !result.is_empty() && !result.ends_with('\n') {
                result.push('\n');
            }
            result.push('\n');
            result.push_str(&line);
        }
    }
    result
}

/// Insert `line` as the last statement before `anchor` inside `function`.
fn insert_before(source: &str, function: &str, anchor: &str, line: &str) -> Result<String> {
    let start = source
        .find(function)
        .ok_or_else(|| anyhow!("could not find `{function}`"))?;
    let offset = source[start..]
        .find(anchor)
        .ok_or_else(|| anyhow!("could not find the end of `{function}`"))?;

    let position = start + offset + 1;
    let mut result = source.to_string();
    result.insert_str(position, line);
    Ok(result)
}

pub fn run(command: MakeCommand, project: &Project, out: &mut impl Write) -> Result<()> {
    match command {
        MakeCommand::Job {
            name,
            queue,
            retries,
            timeout,
            delay,
        } => {
            let options = JobOptions {
                queue,
                retries,
                timeout,
                delay,
            };
            make_job(project, &name, &options, out)
        }
        MakeCommand::Queue {
            name,
            concurrency,
            rate,
        } => make_queue(project, &name, concurrency, rate, out),
        MakeCommand::Event { name } => {
            ensure_pascal_case("Event", &name)?;
            let path = make_event(project, &name)?;
            writeln!(out, "Created event {name} at {}", path.display())?;
            Ok(())
        }
        MakeCommand::Listener { event, listener } => make_listener(project, &event, &listener, out),
    }
}

#[derive(Debug, Default)]
struct JobOptions {
    queue: Option<String>,
    retries: Option<u32>,
    timeout: Option<u64>,
    delay: Option<u64>,
}

fn job_template(name: &str, options: &JobOptions) -> String {
    let mut config = String::new();
    if let Some(queue) = &options.queue {
        config.push_str(&format!("\n        .queue({queue:?})"));
    }
    if let Some(retries) = options.retries {
        config.push_str(&format!("\n        .max_attempts({retries})"));
    }
    if let Some(timeout) = options.timeout {
        config.push_str(&format!("\n        .timeout(Duration::from_millis({timeout}))"));
    }
    if let Some(delay) = options.delay {
        config.push_str(&format!("\n        .delay(Duration::from_millis({delay}))"));
    }
    let duration_import = if options.timeout.is_some() || options.delay.is_some() {
        "use std::time::Duration;\n\n"
    } else {
        ""
    };

    format!(
        r#"{duration_import}use serde::{{Deserialize, Serialize}};
use tracing::info;

use crate::background_job::{{BackgroundJob, JobConfig, JobDefinition}};

/// Wire-level name of [`{name}`].
pub const NAME: &str = "{name}";

/// Payload of [`{name}`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct {name}Payload {{}}

/// Handler of [`{name}Payload`] records.
#[derive(Debug, Default)]
pub struct {name};

impl BackgroundJob for {name} {{
    type Payload = {name}Payload;

    async fn handle(&self, _payload: Self::Payload) -> anyhow::Result<()> {{
        info!("{name} executed");
        Ok(())
    }}
}}

/// Configuration of [`{name}`].
pub fn config() -> JobConfig {{
    JobConfig::new(NAME){config}
}}

/// Dispatch handle for [`{name}`].
pub fn definition() -> JobDefinition<{name}Payload> {{
    JobDefinition::new(config())
}}
"#
    )
}

fn make_job(project: &Project, raw_name: &str, options: &JobOptions, out: &mut impl Write) -> Result<()> {
    ensure_pascal_case("Job", raw_name)?;
    let name = if raw_name.ends_with("Job") {
        raw_name.to_string()
    } else {
        format!("{raw_name}Job")
    };
    let module = snake_case(&name);

    if let Some(queue) = &options.queue {
        let configured = load_queues(&project.queues)?;
        if !configured.iter().any(|config| &config.name == queue) {
            let valid = configured
                .iter()
                .map(|config| config.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            bail!("invalid queue name: {queue} (valid queues: {valid})");
        }
    }

    let jobs_dir = project.src.join("jobs");
    let mod_path = jobs_dir.join("mod.rs");
    let registry = read(&mod_path)?;
    if registry.contains(&format!("{module}::config()")) {
        bail!("job {name} is already registered in {}", mod_path.display());
    }

    let registration = format!("    registry.register({module}::config(), || {module}::{name})?;\n");
    let registry = add_module(&registry, &module);
    let registry = insert_before(&registry, "pub fn register_all", "\n    Ok(())", &registration)?;

    let job_path = jobs_dir.join(format!("{module}.rs"));
    create_file(&job_path, &job_template(&name, options))?;
    fs::write(&mod_path, registry)?;

    writeln!(out, "Created job {name} at {} and registered it", job_path.display())?;
    Ok(())
}

fn make_queue(
    project: &Project,
    name: &str,
    concurrency: usize,
    rate: Option<RateLimit>,
    out: &mut impl Write,
) -> Result<()> {
    ensure!(
        is_kebab_case(name),
        "queue name must be kebab-case (e.g. emails, notifications), got {name:?}"
    );
    ensure!(concurrency > 0, "--concurrency must be a positive integer");

    let mut config = QueueConfig::new(name, concurrency);
    config.rate_limit = rate;
    append_queue(&project.queues, &config)?;

    writeln!(out, "Added queue '{name}' to {}", project.queues.display())?;
    Ok(())
}

fn event_template(name: &str) -> String {
    format!(
        r#"use crate::event_bus::Event;

/// Emitted when {name} happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct {name} {{}}

impl Event for {name} {{
    const NAME: &'static str = "{name}";
}}
"#
    )
}

/// Create the event module and declare it. Returns the path of the new file.
fn make_event(project: &Project, name: &str) -> Result<PathBuf> {
    let module = snake_case(name);
    let events_dir = project.src.join("events");
    let mod_path = events_dir.join("mod.rs");
    let declarations = read(&mod_path)?;

    let event_path = events_dir.join(format!("{module}.rs"));
    create_file(&event_path, &event_template(name))?;
    fs::write(&mod_path, add_module(&declarations, &module))?;
    Ok(event_path)
}

fn listener_template(event: &str, event_module: &str) -> String {
    format!(
        r#"use std::sync::Arc;

use crate::event_bus::EventBus;
use crate::events::{event_module}::{event};
use crate::queue::QueueRegistry;

/// Reacts to [`{event}`].
pub fn register(bus: &mut EventBus, _queues: &Arc<QueueRegistry>) {{
    bus.on(|_event: Arc<{event}>| async {{ Ok(()) }});
}}
"#
    )
}

fn make_listener(project: &Project, event: &str, listener: &str, out: &mut impl Write) -> Result<()> {
    ensure_pascal_case("Event", event)?;
    ensure_pascal_case("Listener", listener)?;

    let event_module = snake_case(event);
    if !project.src.join("events").join(format!("{event_module}.rs")).exists() {
        let path = make_event(project, event)?;
        writeln!(out, "Created event {event} at {}", path.display())?;
    }

    let module = snake_case(listener);
    let listeners_dir = project.src.join("listeners");
    let mod_path = listeners_dir.join("mod.rs");
    let registry = read(&mod_path)?;

    let registration = format!("    {module}::register(bus, queues);\n");
    let registry = add_module(&registry, &module);
    let registry = insert_before(&registry, "pub fn register_all", "\n}", &registration)?;

    let listener_path = listeners_dir.join(format!("{module}.rs"));
    create_file(&listener_path, &listener_template(event, &event_module))?;
    fs::write(&mod_path, registry)?;

    writeln!(out, "Created listener {listener} at {}", listener_path.display())?;
    Ok(())
}
