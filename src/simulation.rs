use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::stream::StreamExt;
use jasper_core::{MemoryStore, Replica, TargetRegistry};
use jasper_sync::{
    from_fn, Conflict, Initial, Manager, ManagerConfigBuilder, ManagerIds, MemoryHub, Result,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Shared document edited by every simulated device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub revision: u64,
    pub author: usize,
    pub edited_at: DateTime<Utc>,
    pub words: Vec<u32>,
}

impl Note {
    fn blank() -> Self {
        Self {
            revision: 0,
            author: 0,
            edited_at: Utc::now(),
            words: Vec::new(),
        }
    }

    fn edit(&self, author: usize, word: u32) -> Self {
        let mut words = self.words.clone();
        words.push(word);
        Self {
            revision: self.revision + 1,
            author,
            edited_at: Utc::now(),
            words,
        }
    }
}

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub devices: usize,
    pub clouds: usize,
    pub edits: usize,
    pub outages: usize,
    pub polls: usize,
    pub replica_writes: usize,
    pub desynced: usize,
    pub final_revision: u64,
    pub converged: bool,
    pub total_time: Duration,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Replication Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Devices:                   {:>30} ║", self.devices);
        println!("║  Cloud Replicas:            {:>30} ║", self.clouds);
        println!("║  Local Edits:               {:>30} ║", self.edits);
        println!("║  Outages Toggled:           {:>30} ║", self.outages);
        println!("║  Explicit Polls:            {:>30} ║", self.polls);
        println!("║  Replica Writes:            {:>30} ║", self.replica_writes);
        println!("║  Desynced After Recovery:   {:>30} ║", self.desynced);
        println!("║  Final Revision:            {:>30} ║", self.final_revision);
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

enum Step {
    Edit { device: usize, word: u32 },
    Outage { cloud: usize, online: bool },
    Poll(usize),
}

/// Generator of random edits, outages and polls
fn step_generator(
    devices: usize,
    clouds: usize,
    steps: usize,
    fault_rate: f64,
) -> impl Stream<Item = Step> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..steps {
            let roll: f64 = rng.gen();
            if roll < fault_rate {
                yield Step::Outage {
                    cloud: rng.gen_range(0..clouds),
                    online: rng.gen_bool(0.5),
                };
            } else if roll < fault_rate + 0.1 {
                yield Step::Poll(rng.gen_range(0..devices));
            } else {
                yield Step::Edit {
                    device: rng.gen_range(0..devices),
                    word: rng.gen(),
                };
            }
        }
    }
}

/// Highest revision wins; edit time and author break ties.
async fn newest(local: Note, conflicts: Vec<Conflict<Note>>) -> Note {
    conflicts
        .into_iter()
        .map(|conflict| conflict.value.value)
        .chain(std::iter::once(local))
        .max_by_key(|note| (note.revision, note.edited_at, note.author))
        .unwrap_or_else(Note::blank)
}

/// Several devices edit one note replicated to flaky cloud stores.
///
/// Device 0 owns the replica set and announces it to the others over the
/// broadcast hub; every device then edits, polls and survives outages.
pub async fn simulate(
    devices: usize,
    clouds: usize,
    steps: usize,
    fault_rate: f64,
) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Replication Simulation                              ║");
    println!("║  Devices: {} | Clouds: {} | Steps: {} | Faults: {:.0}% ║",
             devices, clouds, steps, fault_rate * 100.0);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let ids = ManagerIds::new();
    let registry = TargetRegistry::new().with_memory(store.clone());
    let cloud_ids: Vec<String> = (0..clouds).map(|cloud| format!("cloud-{}", cloud)).collect();

    println!("\n[Phase 1/3] Starting devices...");

    let mut managers: Vec<Manager<Note>> = Vec::with_capacity(devices);
    for device in 0..devices {
        let config = ManagerConfigBuilder::new()
            .id(format!("device-{}", device))
            .poll_period(Some(Duration::from_millis(50)))
            .io_timeout(Some(Duration::from_millis(200)))
            .build();
        let manager = Manager::builder(Initial::with(Note::blank))
            .with_config(config)
            .ids(ids.clone())
            .registry(registry.clone())
            .update_policy(from_fn(newest))
            .startup_policy(from_fn(newest))
            .channel(hub.endpoint())
            .start()
            .await?;
        managers.push(manager);
    }

    if let Some(owner) = managers.first() {
        owner
            .add_replicas(
                cloud_ids
                    .iter()
                    .map(|id| Replica::new(store.target(id.as_str())).compressed(true))
                    .collect(),
            )
            .await?;
    }
    for manager in &managers {
        manager.settled().await?;
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Editing under faults...");

    let mut steps_stream = Box::pin(step_generator(devices.max(1), clouds.max(1), steps, fault_rate));
    let (mut edits, mut outages, mut polls) = (0, 0, 0);
    while let Some(step) = steps_stream.next().await {
        match step {
            Step::Edit { device, word } => {
                if let Some(manager) = managers.get(device) {
                    manager.set_value(manager.value().edit(device, word))?;
                    edits += 1;
                }
            }
            Step::Outage { cloud, online } => {
                if let Some(id) = cloud_ids.get(cloud) {
                    store.target(id.as_str()).set_online(online);
                    outages += 1;
                }
            }
            Step::Poll(device) => {
                if let Some(manager) = managers.get(device) {
                    manager.poll().await?;
                    polls += 1;
                }
            }
        }

        if (edits + outages + polls) % 100 == 0 {
            println!("  Steps completed: {}/{}", edits + outages + polls, steps);
            tokio::task::yield_now().await;
        }
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Recovering...");

    for id in &cloud_ids {
        store.target(id.as_str()).set_online(true);
    }
    for _ in 0..2 {
        for manager in &managers {
            manager.poll().await?;
        }
    }
    for manager in &managers {
        manager.settled().await?;
    }

    let first = managers.first().map(Manager::value).unwrap_or_else(Note::blank);
    let converged = managers.iter().all(|manager| manager.value() == first);
    let replica_writes = cloud_ids
        .iter()
        .map(|id| store.target(id.as_str()).writes())
        .sum();
    let desynced = managers
        .iter()
        .flat_map(|manager| manager.replica_states())
        .filter(|state| state.desynced)
        .count();

    tracing::info!(devices, converged, replica_writes, desynced, "simulation finished");

    for manager in &managers {
        manager.shutdown().await?;
    }

    println!("[Phase 3/3] ✓ Completed");

    Ok(SimulationStats {
        devices,
        clouds,
        edits,
        outages,
        polls,
        replica_writes,
        desynced,
        final_revision: first.revision,
        converged,
        total_time: start.elapsed(),
    })
}

/// Run the simulation at growing device counts
pub async fn simulate_scaling(max_devices: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Devices vs Replica Writes          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut devices = step_size;
    while devices <= max_devices {
        let stats = simulate(devices, 3, devices * 50, 0.05).await?;
        stats.print();
        devices += step_size;
    }
    Ok(())
}
