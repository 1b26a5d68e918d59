//! Schedule inspector.
//!
//! Prints the sprint, primary producer and backup order for a range of
//! heights under a chain configuration file.
//!
//! Run with: `cargo run -- <config.json> <from> [to]`

use eyre::{bail, WrapErr};
use sprint_poa::{ChainConfig, LeaderSchedule};
use tracing::info;

/// Longest range printed in one run.
const MAX_RANGE: u64 = 10_000;

fn main() -> eyre::Result<()> {
    sprint_poa::logging::init("info")?;

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        let program = args.first().map_or("sprint-poa", String::as_str);
        bail!("usage: {program} <config.json> <from> [to]");
    }

    let config = ChainConfig::from_file(&args[1])
        .wrap_err_with(|| format!("failed to load {}", args[1]))?;
    let from: u64 = args[2].parse().wrap_err("invalid <from> height")?;
    let to: u64 = match args.get(3) {
        Some(to) => to.parse().wrap_err("invalid <to> height")?,
        None => from,
    };
    if to < from {
        bail!("<to> ({to}) is below <from> ({from})");
    }
    if to - from >= MAX_RANGE {
        bail!("range of {} heights exceeds the limit of {MAX_RANGE}", to - from + 1);
    }

    let schedule = config.schedule();
    info!(
        target: "poa::inspect",
        validators = schedule.validators_at(from).len(),
        regimes = schedule.sprints().regimes().len(),
        recent_window = config.verifier().recent_window_at(from),
        "Loaded chain configuration"
    );

    print_sprints(&schedule);
    println!();
    println!(
        "{:>10} | {:>7} | {:>6} | primary / backups (difficulty)",
        "height", "sprint", "length"
    );
    println!("{}", "-".repeat(78));
    for height in from..=to {
        print_height(&schedule, height);
    }

    Ok(())
}

fn print_sprints(schedule: &LeaderSchedule) {
    println!("Sprint regimes:");
    for regime in schedule.sprints().regimes() {
        println!(
            "  from block {:>8}: length {:>4}, first sprint {}",
            regime.start, regime.length, regime.first_sprint
        );
    }
}

fn print_height(schedule: &LeaderSchedule, height: u64) {
    let producers = schedule
        .eligible_addresses(height)
        .into_iter()
        .map(|address| {
            let difficulty = schedule.expected_difficulty(height, &address).unwrap_or_default();
            format!("{address} ({difficulty})")
        })
        .collect::<Vec<_>>();

    let marker = if schedule.sprints().is_sprint_start(height) { "*" } else { " " };
    println!(
        "{:>10}{} | {:>7} | {:>6} | {}",
        height,
        marker,
        schedule.sprint_index(height),
        schedule.sprint_length_at(height),
        producers.join(", ")
    );
}
