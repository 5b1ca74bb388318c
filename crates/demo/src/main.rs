use std::time::Duration;

use anyhow::Context;
use batchq_scheduler::{Job, JobConfig, Queue, QueueConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    batchq_observability::init();

    let config = QueueConfig::from_env();
    if config.persistence_dir.is_none() {
        tracing::warn!("BATCHQ_PERSIST_DIR not set; completed jobs stay in memory only");
    }
    let queue = Queue::from_config(&config);

    let mut signals = queue.subscribe();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            tracing::info!(
                signal = signal.kind(),
                job = ?signal.job().map(|j| j.as_str()),
                operation = ?signal.operation().map(|o| o.as_str()),
                "queue signal"
            );
        }
    });

    // Every multiple of seven fails once before succeeding.
    let squares = Job::new(
        "squares",
        (1u64..=10).collect(),
        JobConfig::default()
            .with_concurrency_limit(3)
            .with_max_failures_per_operation(2)
            .with_throttle(Duration::from_millis(100)),
        {
            let flaked = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            move |n: u64| {
                let first_try = {
                    let mut seen = flaked.lock().unwrap_or_else(|e| e.into_inner());
                    if seen.contains(&n) {
                        false
                    } else {
                        seen.push(n);
                        true
                    }
                };
                async move {
                    tokio::time::sleep(Duration::from_millis(20 * n)).await;
                    if n % 7 == 0 && first_try {
                        anyhow::bail!("{n} is unlucky this time");
                    }
                    Ok(n * n)
                }
            }
        },
    )?;

    let shout = Job::with_ids(
        "shout",
        vec!["batch".to_string(), "queue".to_string(), "".to_string()],
        |word, index| format!("{index}-{word}").into(),
        JobConfig::default()
            .with_concurrency_limit(2)
            .with_cooldown(Duration::from_millis(250)),
        |word: String| async move {
            if word.is_empty() {
                anyhow::bail!("nothing to shout");
            }
            Ok(word.to_uppercase())
        },
    )?;

    let pending = [queue.submit(squares)?, queue.submit(shout)?];
    for completion in pending {
        let name = completion.wait().await?;
        let export = queue
            .job_export(name.as_str(), false)
            .with_context(|| format!("export for {name}"))?;
        tracing::info!(
            job = %name,
            completed = export.operations_completed_count,
            failed = export.failed_operations().count(),
            "job finished"
        );
        println!("{}", serde_json::to_string_pretty(&export)?);
    }

    let stats = queue.stats();
    tracing::info!(
        pending = stats.pending,
        running = stats.running,
        completed = stats.completed,
        "queue drained"
    );
    Ok(())
}
