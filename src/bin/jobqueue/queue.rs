use std::io::Write;

use anyhow::{Result, bail};
use clap::Subcommand;
use jobqueue::QueueRegistry;
use jobqueue::schema::JobCounts;
use serde::Serialize;

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List the configured queues
    List,
    /// Show job counts per state for all queues or a single queue
    Stats {
        /// Only show this queue
        queue: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove every job of a queue (pause, drain, clean, resume)
    Clear {
        /// Queue to clear
        queue: String,
    },
}

#[derive(Debug, Serialize)]
struct QueueStats<'a> {
    queue: &'a str,
    #[serde(flatten)]
    counts: JobCounts,
}

fn ensure_known(queues: &QueueRegistry, name: &str) -> Result<()> {
    if queues.queue(name).is_none() {
        let available = queues.names().collect::<Vec<_>>().join(", ");
        bail!("unknown queue: {name} (available queues: {available})");
    }
    Ok(())
}

pub async fn run(command: QueueCommand, queues: &QueueRegistry, out: &mut impl Write) -> Result<()> {
    match command {
        QueueCommand::List => {
            if queues.configs().is_empty() {
                writeln!(out, "No queues configured")?;
                return Ok(());
            }
            for queue in queues.configs() {
                match queue.rate_limit {
                    Some(limit) => writeln!(
                        out,
                        "{} (concurrency={}, rate={}/{}ms)",
                        queue.name, queue.concurrency, limit.max, limit.duration_ms
                    )?,
                    None => writeln!(out, "{} (concurrency={})", queue.name, queue.concurrency)?,
                }
            }
        }
        QueueCommand::Stats { queue, json } => {
            let names = match &queue {
                Some(name) => {
                    ensure_known(queues, name)?;
                    vec![name.as_str()]
                }
                None => queues.names().collect(),
            };

            let mut stats = Vec::with_capacity(names.len());
            for name in names {
                let counts = queues.stats(name).await?;
                stats.push(QueueStats {
                    queue: name,
                    counts,
                });
            }

            if json {
                serde_json::to_writer_pretty(&mut *out, &stats)?;
                writeln!(out)?;
            } else {
                for QueueStats { queue, counts } in &stats {
                    writeln!(out, "{queue}")?;
                    writeln!(out, "  waiting:   {}", counts.waiting)?;
                    writeln!(out, "  active:    {}", counts.active)?;
                    writeln!(out, "  delayed:   {}", counts.delayed)?;
                    writeln!(out, "  completed: {}", counts.completed)?;
                    writeln!(out, "  failed:    {}", counts.failed)?;
                }
            }
        }
        QueueCommand::Clear { queue } => {
            ensure_known(queues, &queue)?;
            let summary = queues.clear(&queue).await?;
            writeln!(
                out,
                "Cleared queue '{queue}' ({} waiting or delayed, {} other jobs removed)",
                summary.drained, summary.cleaned
            )?;
        }
    }
    Ok(())
}
