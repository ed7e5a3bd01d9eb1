//! # Tally Reconciliation
//!
//! Approving a ballot writes the ballot before it bumps the candidate counter, so a crash in
//! between leaves the counter one short. This tool recounts every poll from ballot states.
//!
//! ## Steps
//! 1. Load every voter record once, ballots live on the voter.
//!
//! 2. For each poll, count approved ballots per candidate and compare with `poll:<id>:votes`.
//!
//! 3. Print the drifted candidates. With `repair`, overwrite the counter with the recount.
//!
//! ## Notes
//! - Run while no admin is reviewing, a concurrent approval can show up as drift for one run.
//! - Counters are overwritten with HSET, never incremented, so repeated repairs are safe.
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ledger::{
    ports::DocumentStore,
    tally::{RecountReport, recount},
};
use server::database::RedisStore;

pub async fn connect(redis_url: &str) -> Result<RedisStore> {
    RedisStore::connect(redis_url)
        .await
        .with_context(|| format!("connecting to {redis_url}"))
}

pub async fn grant_admin(store: &RedisStore, voter_id: &str) -> Result<()> {
    let voter = store
        .voter(voter_id)
        .await?
        .with_context(|| format!("no voter record for {voter_id}"))?;

    store.add_admin(&voter.id).await?;
    println!("Granted admin to {} ({})", voter.id, voter.display_id);

    Ok(())
}

pub async fn reconcile_polls(store: &dyn DocumentStore, repair: bool) -> Result<Vec<RecountReport>> {
    let polls = store.polls(None).await.context("loading polls")?;
    let voters = store.voters().await.context("loading voters")?;

    println!("Loaded Polls: {}", polls.len());
    println!("Loaded Voters: {}\n", voters.len());

    let pb = ProgressBar::new(polls.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=> "),
    );

    let mut reports = Vec::with_capacity(polls.len());
    let mut drifted = 0;

    for poll in &polls {
        pb.set_message(format!("Recounting {}", poll.id));

        let report = recount(poll, &voters);
        for drift in report.drifted() {
            drifted += 1;
            pb.println(format!(
                "{} / {}: stored {}, ballots {}",
                poll.id, drift.candidate_id, drift.stored, drift.recomputed
            ));

            if repair {
                store
                    .set_votes(&poll.id, &drift.candidate_id, drift.recomputed)
                    .await
                    .with_context(|| format!("repairing {} / {}", poll.id, drift.candidate_id))?;
            }
        }

        reports.push(report);
        pb.inc(1);
    }

    pb.finish_with_message("Done");

    if drifted == 0 {
        println!("\nAll tallies match approved ballots.");
    } else if repair {
        println!("\nRepaired Counters: {drifted}");
    } else {
        println!("\nDrifted Counters: {drifted}");
        println!("Run with `repair` to overwrite them.");
    }

    Ok(reports)
}
