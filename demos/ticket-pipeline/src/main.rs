use probe_core::config::{default_config, load_config, StageConfig};
use probe_core::multicore::{RoutingKey, Stage, StageSnapshot, WorkManager, WorkerPoolEntity};
use probe_core::queue::DecouplingQueue;
use probe_core::stats::{CounterRegistry, CounterSpec};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Local;
use clap::Parser;

const PDUS: usize = 0;
const OPENED: usize = 1;
const CLOSED: usize = 2;
const EXPIRED: usize = 3;
const ORPHANS: usize = 4;
const TICKS: usize = 5;

// Define command-line arguments.
#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    /// Number of synthetic subscribers.
    #[clap(short, long, default_value = "1000")]
    subscribers: u64,
    /// Data PDUs per subscriber session.
    #[clap(short, long, default_value = "20")]
    pdus: u32,
    /// Broadcast an expiry tick every N sessions.
    #[clap(long, default_value = "100")]
    tick_every: u64,
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    csv: Option<PathBuf>,
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    json: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum Record {
    Attach { imsi: u64 },
    Data { imsi: u64, bytes: u32 },
    Detach { imsi: u64 },
    /// Expires tickets idle for more than one tick.
    Tick { epoch: u64 },
}

#[derive(Debug, Default, Clone)]
struct Ticket {
    pdus: u32,
    bytes: u64,
    last_epoch: u64,
}

/// Correlates the PDUs of one subscriber into a ticket. Every worker owns the tickets of the
/// subscribers routed to it.
#[derive(Clone)]
struct TicketStage {
    counters: Arc<CounterRegistry>,
    open: HashMap<u64, Ticket>,
    epoch: u64,
}

impl TicketStage {
    fn new(counters: Arc<CounterRegistry>) -> Self {
        TicketStage {
            counters,
            open: HashMap::new(),
            epoch: 0,
        }
    }
}

impl Stage for TicketStage {
    type Item = Record;

    fn do_processing(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Attach { imsi } => {
                self.counters.inc(PDUS, 1);
                let ticket = Ticket {
                    last_epoch: self.epoch,
                    ..Default::default()
                };
                if self.open.insert(imsi, ticket).is_some() {
                    bail!("subscriber {} attached twice", imsi);
                }
                self.counters.inc(OPENED, 1);
            }
            Record::Data { imsi, bytes } => {
                self.counters.inc(PDUS, 1);
                let Some(ticket) = self.open.get_mut(&imsi) else {
                    self.counters.inc(ORPHANS, 1);
                    return Ok(());
                };
                ticket.pdus += 1;
                ticket.bytes += u64::from(bytes);
                ticket.last_epoch = self.epoch;
            }
            Record::Detach { imsi } => {
                self.counters.inc(PDUS, 1);
                match self.open.remove(&imsi) {
                    Some(ticket) => {
                        log::debug!(
                            "Ticket {} closed: {} pdus, {} bytes",
                            imsi,
                            ticket.pdus,
                            ticket.bytes
                        );
                        self.counters.inc(CLOSED, 1);
                    }
                    None => self.counters.inc(ORPHANS, 1),
                }
            }
            Record::Tick { epoch } => {
                self.counters.inc(TICKS, 1);
                self.epoch = epoch;
                let before = self.open.len();
                self.open.retain(|_, t| t.last_epoch + 1 >= epoch);
                self.counters.inc(EXPIRED, (before - self.open.len()) as u64);
            }
        }
        Ok(())
    }

    fn routing_key(&self, record: &Record) -> RoutingKey {
        match record {
            Record::Attach { imsi } | Record::Data { imsi, .. } | Record::Detach { imsi } => {
                RoutingKey::Key(*imsi)
            }
            Record::Tick { .. } => RoutingKey::Broadcast,
        }
    }

    fn on_master_init(&self, snapshot: &StageSnapshot) {
        log::info!("Ticket stage running on {} workers", snapshot.worker_count);
    }

    fn on_slave_terminate(&mut self) {
        self.counters.inc(EXPIRED, self.open.len() as u64);
        self.open.clear();
    }
}

fn configure_counters(counters: &CounterRegistry) -> Result<()> {
    counters.configure(CounterSpec::new(PDUS, "pdus", "PDUs received").write_to_db(true))?;
    counters.configure(
        CounterSpec::new(OPENED, "tickets_opened", "Tickets opened")
            .section("tickets")
            .write_to_db(true),
    )?;
    counters.configure(
        CounterSpec::new(CLOSED, "tickets_closed", "Tickets closed")
            .section("tickets")
            .write_to_db(true),
    )?;
    counters.configure(
        CounterSpec::new(EXPIRED, "tickets_expired", "Tickets expired").section("tickets"),
    )?;
    counters.configure(
        CounterSpec::new(ORPHANS, "orphan_pdus", "PDUs without ticket").section("errors"),
    )?;
    counters.configure(
        CounterSpec::new(TICKS, "ticks", "Expiry ticks").write_to_file(false),
    )?;
    Ok(())
}

/// Synthetic session: attach, `pdus` data PDUs, detach.
fn session(imsi: u64, pdus: u32) -> impl Iterator<Item = Record> {
    std::iter::once(Record::Attach { imsi })
        .chain((0..pdus).map(move |i| Record::Data {
            imsi,
            bytes: 64 + (imsi as u32).wrapping_mul(31).wrapping_add(i * 17) % 1400,
        }))
        .chain(std::iter::once(Record::Detach { imsi }))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };

    let counters = Arc::new(CounterRegistry::from_config(&config.counters));
    configure_counters(&counters)?;

    let stage_config = config
        .stage("tickets")
        .cloned()
        .unwrap_or_else(|| StageConfig::new("tickets", 2));
    let scheduler = Arc::new(WorkManager::new());
    let pool = Arc::new(WorkerPoolEntity::new(
        stage_config,
        TicketStage::new(Arc::clone(&counters)),
        Arc::clone(&scheduler),
    ));
    pool.start()?;

    let master = Arc::clone(&pool);
    let queue = DecouplingQueue::builder("pdus")
        .config(config.queue.clone())
        .dispatch(move |record| {
            master.process(record);
        })
        .on_term(|| log::info!("PDU dispatcher drained"))
        .spawn()?;

    let mut rejected = 0u64;
    for imsi in 0..args.subscribers {
        for record in session(imsi, args.pdus) {
            let mut record = record;
            // Back off while the dispatcher catches up.
            while let Err(e) = queue.push(record) {
                if !e.is_full() {
                    bail!("queue closed while producing");
                }
                rejected += 1;
                record = e.into_inner();
                std::thread::yield_now();
            }
        }
        if args.tick_every > 0 && (imsi + 1) % args.tick_every == 0 {
            let epoch = (imsi + 1) / args.tick_every;
            if queue.push(Record::Tick { epoch }).is_err() {
                log::warn!("Tick {} rejected", epoch);
            }
        }
    }
    queue.flush()?;
    if let Some(work_id) = pool.work_id() {
        scheduler.wait_for_completion(work_id);
    }
    pool.stop();

    println!("{}", counters.render_table());
    println!("queue: {} ({} retries)", queue.stats(), rejected);
    println!("stage: {}", pool.stats().snapshot());
    for statement in counters.to_db_statements(&Local::now()) {
        println!("{}", statement);
    }

    if let Some(path) = &args.csv {
        counters.dump_csv(path)?;
    }
    if let Some(path) = &args.json {
        counters.dump_json(path)?;
    }
    Ok(())
}
