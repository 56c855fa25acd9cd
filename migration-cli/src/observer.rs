use anyhow::{anyhow, Result};
use partmig_engine::bus::{Command, EngineEvent, ObserverHandle, Progress, TruncateDecision};
use partmig_engine::run::RunOutcome;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;

fn render_event(event: &EngineEvent) {
    match event {
        EngineEvent::Log(line) => eprintln!("{}", line.render()),
        EngineEvent::State(state) => eprintln!("worker state: {state}"),
        EngineEvent::ConnectionStatus {
            endpoint,
            connected,
        } => {
            if *connected {
                eprintln!("connected to {endpoint}");
            } else {
                eprintln!("lost connection to {endpoint}");
            }
        }
        // answered by the observe loop itself
        EngineEvent::TruncateRequest { .. } => {}
    }
}

fn render_progress(p: &Progress) {
    eprintln!(
        "[{}/{}] {}: {} rows in partition, {} total, {:.0} rows/s, {:.2} MB/s, eta {}s",
        p.partition_index + 1,
        p.partition_count,
        p.partition_name,
        p.partition_rows,
        p.total_rows,
        p.rows_per_sec,
        p.mb_per_sec,
        p.eta_seconds
    );
}

async fn prompt_truncate(
    lines: &mut Lines<BufReader<Stdin>>,
    partition: &str,
    rows: i64,
) -> Result<TruncateDecision> {
    eprintln!("target partition {partition} already holds {rows} rows.");
    eprintln!("truncate it and continue? [y/N]");
    let answer = lines.next_line().await?;
    Ok(match answer.as_deref().map(str::trim) {
        Some(a) if a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes") => {
            TruncateDecision::Approve
        }
        _ => TruncateDecision::Deny,
    })
}

/// Drives the observer side of a run: renders events and the latest
/// progress, answers truncate prompts and converts Ctrl-C into a stop
/// command. Returns once the engine task finishes.
pub async fn observe(
    mut handle: ObserverHandle,
    assume_yes: bool,
    mut task: JoinHandle<Result<RunOutcome>>,
) -> Result<RunOutcome> {
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stopping = false;
    let mut events_open = true;
    let mut progress_open = true;
    loop {
        tokio::select! {
            joined = &mut task => {
                while let Ok(event) = handle.events.try_recv() {
                    render_event(&event);
                }
                return match joined {
                    Ok(result) => result,
                    Err(e) => Err(anyhow!("engine task failed: {e}")),
                };
            }
            event = handle.events.recv(), if events_open => {
                match event {
                    Some(EngineEvent::TruncateRequest { partition, target_rows }) => {
                        let decision = if assume_yes {
                            TruncateDecision::Approve
                        } else {
                            prompt_truncate(&mut stdin_lines, &partition, target_rows).await?
                        };
                        let _ = handle.commands.send(Command::TruncateResponse(decision));
                    }
                    Some(event) => render_event(&event),
                    None => events_open = false,
                }
            }
            changed = handle.progress.changed(), if progress_open => {
                match changed {
                    Ok(()) => {
                        let snapshot = handle.progress.borrow_and_update().clone();
                        if let Some(progress) = snapshot {
                            render_progress(&progress);
                        }
                    }
                    Err(_) => progress_open = false,
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                eprintln!("stop requested; waiting for the engine to unwind");
                stopping = true;
                let _ = handle.commands.send(Command::Stop);
            }
        }
    }
}
