//! Fork Scenario
//!
//! Simulates a network partition under sprint rotation:
//! - All validators build a common prefix
//! - The network splits into a majority {V0, V1} and a minority {V2}
//! - Each side keeps producing with whoever the schedule allows
//! - The partition heals and fork choice picks the winner
//!
//! The minority stalls as soon as the recent-signer rule forbids its only
//! validator from signing the next sprint.
//!
//! Run with: `cargo run --bin sprint_scenario`

use eyre::{bail, WrapErr};
use sprint_poa::{
    consensus::{BlockImporter, ChainHeadTracker, ConsensusVerifier, TrackerConfig},
    simulation::{genesis_header, test_validators, TestValidator, BLOCK_TIME},
    Header, LeaderSchedule, SealedHeader, SprintTable, ValidatorSet, EXTRA_VANITY,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, warn};

/// Heights built before the partition.
const COMMON_PREFIX_SLOTS: u64 = 12;
/// Production attempts on each side of the partition.
const PARTITION_SLOTS: u64 = 16;

/// A node seeing only the blocks produced by its own partition.
struct PartitionNode {
    name: &'static str,
    members: Vec<usize>,
    tag: u8,
    importer: BlockImporter,
}

impl PartitionNode {
    fn new(
        name: &'static str,
        members: Vec<usize>,
        tag: u8,
        schedule: &LeaderSchedule,
        genesis: &SealedHeader,
    ) -> Self {
        let verifier = Arc::new(ConsensusVerifier::new(schedule.clone()));
        let tracker = Arc::new(
            ChainHeadTracker::new(genesis.clone(), TrackerConfig::default())
                .with_span(info_span!("node", name)),
        );
        let importer = BlockImporter::new(verifier, tracker).with_span(info_span!("import", name));
        Self { name, members, tag, importer }
    }

    fn tracker(&self) -> &Arc<ChainHeadTracker> {
        self.importer.tracker()
    }

    /// Seal the next block with the best-placed member allowed to produce it.
    fn produce(&self, validators: &[TestValidator]) -> Option<(usize, SealedHeader)> {
        let tip = self.tracker().current_head();
        let number = tip.number + 1;
        let schedule = self.importer.verifier().schedule();

        for index in schedule.eligible_producers(number) {
            if !self.members.contains(&index) {
                continue;
            }
            let validator = &validators[index];
            let Some(difficulty) = schedule.expected_difficulty(number, &validator.address())
            else {
                continue;
            };

            let mut vanity = vec![0u8; EXTRA_VANITY];
            vanity[0] = self.tag;
            let header = validator.seal(Header {
                parent_hash: tip.hash(),
                number,
                timestamp: tip.timestamp + BLOCK_TIME,
                difficulty,
                extra_data: vanity.into(),
            });

            if self.importer.verifier().author_of(&header, self.tracker().as_ref()).is_ok() {
                return Some((index, header));
            }
        }
        None
    }

    fn print_status(&self, prefix: &str) {
        let head = self.tracker().current_head();
        let difficulty: u128 =
            self.tracker().canonical_chain().iter().map(|h| u128::from(h.difficulty)).sum();
        println!(
            "{prefix}{}: head={} number={} TD={}",
            self.name,
            &format!("{:?}", head.hash())[..14],
            head.number,
            difficulty
        );
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    sprint_poa::logging::init("warn,poa::tracker=info")?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          Sprint Rotation Fork Scenario                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let validators = test_validators(3);
    let set = ValidatorSet::new(validators.iter().map(TestValidator::address).collect())?;
    let sprints = SprintTable::from_json_str(r#"{"0": 4, "8": 2}"#)?;
    let schedule = LeaderSchedule::new(sprints, set);
    let genesis = genesis_header();

    println!("Validators:");
    for (i, v) in validators.iter().enumerate() {
        println!("  V{i}: {}", v.address());
    }
    println!("Sprints:");
    for regime in schedule.sprints().regimes() {
        println!("  from block {:>3}: length {}", regime.start, regime.length);
    }
    println!();

    let majority = PartitionNode::new("A", vec![0, 1], 0xA, &schedule, &genesis);
    let minority = PartitionNode::new("B", vec![2], 0xB, &schedule, &genesis);
    let everyone = PartitionNode::new("all", vec![0, 1, 2], 0, &schedule, &genesis);

    // ========================================
    // Phase 1: Build common prefix
    // ========================================
    println!("═══════════════════════════════════════════════════════════════");
    println!(" Phase 1: Building Common Prefix ({COMMON_PREFIX_SLOTS} slots)");
    println!("═══════════════════════════════════════════════════════════════\n");

    for _ in 0..COMMON_PREFIX_SLOTS {
        let Some((producer, header)) = everyone.produce(&validators) else {
            bail!("no validator could produce block {}", everyone.tracker().head_info().number + 1);
        };
        println!(
            "  Block {:>2}: sprint {:>2}, V{producer} (in_turn={}, diff={})",
            header.number,
            schedule.sprint_index(header.number),
            schedule.is_in_turn(header.number, &validators[producer].address()),
            header.difficulty,
        );
        for node in [&everyone, &majority, &minority] {
            node.importer
                .import_header(header.clone())
                .wrap_err_with(|| format!("node {} refused block {}", node.name, header.number))?;
        }
    }

    println!();
    majority.print_status("  ");
    minority.print_status("  ");
    let fork_point = majority.tracker().head_info();

    // ========================================
    // Phase 2: Network partition
    // ========================================
    println!("\n═══════════════════════════════════════════════════════════════");
    println!(" Phase 2: Network Partition ({PARTITION_SLOTS} slots)");
    println!("═══════════════════════════════════════════════════════════════\n");

    println!("  ┌─────────────────┐     ┌─────────────────┐");
    println!("  │  Partition A    │     │  Partition B    │");
    println!("  │    V0 + V1      │ X X │      V2         │");
    println!("  └─────────────────┘     └─────────────────┘\n");

    for node in [&majority, &minority] {
        let mut produced = 0;
        let mut stalled = 0;
        for _ in 0..PARTITION_SLOTS {
            match node.produce(&validators) {
                Some((_, header)) => {
                    node.importer.import_header(header)?;
                    produced += 1;
                }
                None => stalled += 1,
            }
        }
        println!("  Partition {}: {produced} blocks produced, {stalled} slots stalled", node.name);
    }
    println!();
    majority.print_status("  ");
    minority.print_status("  ");

    // ========================================
    // Phase 3: Partition heals
    // ========================================
    println!("\n═══════════════════════════════════════════════════════════════");
    println!(" Phase 3: Partition Heals - Fork Resolution");
    println!("═══════════════════════════════════════════════════════════════\n");

    let (mut a_events, _a_handle) = majority.tracker().subscribe_reorg_events();
    let (mut b_events, _b_handle) = minority.tracker().subscribe_reorg_events();

    let a_chain = majority.tracker().canonical_chain();
    let b_chain = minority.tracker().canonical_chain();
    let target = a_chain.len().max(b_chain.len()) as u64 - 1;

    let waiter = {
        let tracker = Arc::clone(minority.tracker());
        tokio::spawn(async move { tracker.wait_for_head(target, Duration::from_secs(5)).await })
    };

    let failed = majority
        .importer
        .import_batch(b_chain.into_iter().skip(1).collect())
        .into_iter()
        .chain(minority.importer.import_batch(a_chain.into_iter().skip(1).collect()))
        .filter(Result::is_err)
        .count();
    if failed > 0 {
        warn!(target: "poa::scenario", failed, "Some headers were refused while merging");
    }

    let b_head = waiter.await?.wrap_err("node B never reached the merged height")?;
    info!(target: "poa::scenario", number = b_head.number, hash = %b_head.hash, "Node B caught up");

    for (name, events) in [("A", &mut a_events), ("B", &mut b_events)] {
        match events.recv_timeout(Duration::from_millis(100)).await {
            Ok(event) => println!(
                "  {name}: reorg from block {} (-{} / +{} blocks)",
                event.common_block.number,
                event.removed.len(),
                event.added.len()
            ),
            Err(_) => println!("  {name}: kept its chain"),
        }
    }

    println!("\nFinal chain status after merge:");
    majority.print_status("  ");
    minority.print_status("  ");

    let a_head = majority.tracker().head_info();
    let b_head = minority.tracker().head_info();
    let fork_hash = format!("{:?}", fork_point.hash);
    println!("\n  Fork point: block {} ({})", fork_point.number, &fork_hash[..14]);
    if a_head != b_head {
        bail!("nodes disagree: A at {} / B at {}", a_head.number, b_head.number);
    }
    println!("\n✓ SUCCESS: Both partitions converged on block {}", a_head.number);

    Ok(())
}
