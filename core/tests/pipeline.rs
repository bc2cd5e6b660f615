use probe_core::config::{parse_config, QueueConfig, StageConfig};
use probe_core::multicore::{
    current_worker_key, RoutingKey, Stage, StageSnapshot, WorkManager, WorkerPoolEntity,
};
use probe_core::queue::DecouplingQueue;
use probe_core::stats::{CounterRegistry, CounterSpec, ReportIdentity};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SEEN: usize = 0;
const BROADCASTS: usize = 1;
const INITS: usize = 2;

#[derive(Debug, Clone)]
enum Record {
    Pdu { imsi: u64, seq: u32 },
    Tick,
}

/// Records, per routing key, the worker and the sequence numbers it saw.
#[derive(Clone)]
struct Tracker {
    counters: Arc<CounterRegistry>,
    seen: Arc<Mutex<HashMap<u64, Vec<(usize, u32)>>>>,
}

impl Stage for Tracker {
    type Item = Record;

    fn do_processing(&mut self, item: Record) -> anyhow::Result<()> {
        match item {
            Record::Pdu { imsi, seq } => {
                let worker = current_worker_key().unwrap_or(usize::MAX);
                self.seen
                    .lock()
                    .unwrap()
                    .entry(imsi)
                    .or_default()
                    .push((worker, seq));
                self.counters.inc(SEEN, 1);
            }
            Record::Tick => self.counters.inc(BROADCASTS, 1),
        }
        Ok(())
    }

    fn routing_key(&self, item: &Record) -> RoutingKey {
        match item {
            Record::Pdu { imsi, .. } => RoutingKey::Key(*imsi),
            Record::Tick => RoutingKey::Broadcast,
        }
    }

    fn on_slave_init(&mut self, _snapshot: &StageSnapshot) {
        self.counters.inc(INITS, 1);
    }
}

fn counters() -> Arc<CounterRegistry> {
    let counters = CounterRegistry::new(8, ReportIdentity::new("probe-01", "probe", "pipeline"));
    counters
        .configure(CounterSpec::new(SEEN, "pdus", "PDUs processed").write_to_db(true))
        .unwrap();
    counters
        .configure(CounterSpec::new(BROADCASTS, "ticks", "Ticks processed").section("timers"))
        .unwrap();
    counters
        .configure(CounterSpec::new(INITS, "inits", "Slave inits").section("timers"))
        .unwrap();
    Arc::new(counters)
}

#[test]
fn queue_feeds_keyed_pool() {
    const WORKERS: usize = 4;
    const SUBSCRIBERS: u64 = 13;
    const PER_SUBSCRIBER: u32 = 200;

    let counters = counters();
    let tracker = Tracker {
        counters: Arc::clone(&counters),
        seen: Arc::new(Mutex::new(HashMap::new())),
    };
    let scheduler = Arc::new(WorkManager::new());
    let pool = Arc::new(WorkerPoolEntity::new(
        StageConfig::new("tracker", WORKERS),
        tracker.clone(),
        Arc::clone(&scheduler),
    ));
    pool.start().unwrap();

    let master = Arc::clone(&pool);
    let queue = DecouplingQueue::new("records", QueueConfig::with_capacity(64), move |record| {
        master.process(record);
    })
    .unwrap();

    let mut pushed = 0;
    for seq in 0..PER_SUBSCRIBER {
        for imsi in 0..SUBSCRIBERS {
            let mut record = Record::Pdu { imsi, seq };
            while let Err(e) = queue.push(record) {
                record = e.into_inner();
                std::thread::yield_now();
            }
            pushed += 1;
        }
    }
    queue.push(Record::Tick).unwrap();
    queue.flush().unwrap();
    assert_eq!(queue.stats().dispatched, pushed + 1);

    scheduler.wait_for_completion(pool.work_id().unwrap());
    let stats = pool.stats().snapshot();
    assert!(pool.stop());

    // A delivery rejected by a full worker queue counts as dropped.
    let processed_pdus = counters.get_aggregate(SEEN);
    assert_eq!(stats.dropped + stats.dispatched, pushed + WORKERS as u64);

    let seen = tracker.seen.lock().unwrap();
    for (imsi, entries) in seen.iter() {
        let worker = entries[0].0;
        assert!(entries.iter().all(|(w, _)| *w == worker), "imsi {} moved", imsi);
        assert_eq!(worker, (*imsi % WORKERS as u64) as usize);
        let seqs: Vec<_> = entries.iter().map(|(_, seq)| *seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "imsi {} out of order", imsi);
    }
    let total: usize = seen.values().map(|v| v.len()).sum();
    assert_eq!(total as u64, processed_pdus);
    assert!(counters.get_aggregate(INITS) <= WORKERS as u64);

    let table = counters.render_table();
    assert!(table.contains("PDUs processed"));
    assert!(table.contains("timers"));
}

#[test]
fn broadcast_reaches_all_workers() {
    let counters = counters();
    let tracker = Tracker {
        counters: Arc::clone(&counters),
        seen: Arc::new(Mutex::new(HashMap::new())),
    };
    let pool = WorkerPoolEntity::new(
        StageConfig::new("ticks", 3),
        tracker,
        Arc::new(WorkManager::new()),
    );

    assert_eq!(pool.process(Record::Tick), 0);
    pool.start().unwrap();
    assert_eq!(pool.process(Record::Tick), 3);
    assert_eq!(pool.process(Record::Tick), 3);
    assert!(pool.stop());

    assert_eq!(counters.get_aggregate(BROADCASTS), 6);
    assert_eq!(counters.get_aggregate(INITS), 3);
    assert_eq!(pool.stats().snapshot().discarded, 1);
}

#[test]
fn pool_built_from_config() {
    let config = parse_config(
        r#"
        [queue]
        capacity = 16

        [[stages]]
        name = "tracker"
        workers = 2
        queue_size = 64
        "#,
    )
    .unwrap();
    let stage = config.stage("tracker").unwrap().clone();
    assert_eq!(config.queue.capacity, 16);

    let counters = counters();
    let tracker = Tracker {
        counters: Arc::clone(&counters),
        seen: Arc::new(Mutex::new(HashMap::new())),
    };
    let pool = WorkerPoolEntity::new(stage, tracker, Arc::new(WorkManager::new()));
    pool.start().unwrap();
    assert_eq!(pool.worker_count(), 2);
    for seq in 0..10 {
        assert_eq!(pool.process(Record::Pdu { imsi: 42, seq }), 1);
    }
    assert!(pool.stop());
    assert_eq!(counters.get_aggregate(SEEN), 10);
}
