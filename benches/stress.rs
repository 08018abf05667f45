use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use darshan::config::PlatformConfig;
use darshan::engine::{EngineError, NewBooking, Platform, SosReport};
use darshan::model::{Ambulance, PriorityType, Slot, SosType, UnitStatus};
use darshan::notify::NotifyHub;
use darshan::store::MemStore;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn platform(durable: bool) -> Platform {
    let store = if durable {
        let dir = std::env::temp_dir().join(format!("darshan_bench_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).expect("create bench dir");
        Arc::new(MemStore::open(&dir.join("darshan.wal")).expect("open WAL"))
    } else {
        Arc::new(MemStore::new())
    };
    Platform::new(store, Arc::new(NotifyHub::new()), &PlatformConfig::default())
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2027, 1, 14).expect("valid date")
}

async fn slot(p: &Platform, capacity: u32) -> Slot {
    p.slots
        .create_slot(
            day(),
            NaiveTime::from_hms_opt(4, 0, 0).expect("valid time"),
            NaiveTime::from_hms_opt(6, 0, 0).expect("valid time"),
            capacity,
        )
        .await
        .expect("create slot")
}

fn booking(slot: &Slot, i: usize, members: u32) -> NewBooking {
    NewBooking {
        user_id: format!("user-{i}"),
        name: format!("Pilgrim {i}"),
        phone: None,
        date: Some(slot.date),
        slot_id: Some(slot.id),
        members_count: members,
        priority_type: PriorityType::Normal,
    }
}

async fn phase1_sequential() {
    let p = platform(true);
    let s = slot(&p, 100_000).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        p.ledger.create(booking(&s, i, 1)).await.expect("booking");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} durable bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_one_hot_slot() {
    let p = Arc::new(platform(true));
    let capacity = 500;
    let s = slot(&p, capacity).await;

    let n_tasks = 50;
    let n_per_task = 20;
    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let p = p.clone();
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_task);
            let mut rejected = 0;
            for j in 0..n_per_task {
                let at = Instant::now();
                match p.ledger.create(booking(&s, t * n_per_task + j, 1)).await {
                    Ok(_) => latencies.push(at.elapsed()),
                    Err(EngineError::CapacityExceeded { .. }) => rejected += 1,
                    Err(e) => panic!("unexpected: {e}"),
                }
            }
            (latencies, rejected)
        }));
    }

    let mut latencies = Vec::new();
    let mut rejected = 0;
    for h in handles {
        let (l, r) = h.await.expect("task");
        latencies.extend(l);
        rejected += r;
    }
    let elapsed = start.elapsed();
    let booked = p.slots.get(s.id).await.expect("slot").booked_count;
    println!(
        "  {n_tasks} tasks x {n_per_task} on one slot of {capacity}: {} accepted, {rejected} full in {:.2}s",
        latencies.len(),
        elapsed.as_secs_f64()
    );
    println!("  final booked_count={booked} (invariant holds: {})", booked <= capacity);
    print_latency("accepted create latency", &mut latencies);
}

async fn phase3_dispatch_storm() {
    let p = Arc::new(platform(false));
    let fleet = 10;
    for i in 0..fleet {
        p.ambulances
            .register(Ambulance {
                id: format!("amb-{i}"),
                status: UnitStatus::Available,
                location: "Main Temple".into(),
                crew: 2,
                assigned_case: None,
            })
            .await
            .expect("register");
    }

    let n_cases = 200;
    let mut cases = Vec::with_capacity(n_cases);
    for _ in 0..n_cases {
        let case = p
            .dispatch
            .report(SosReport {
                user_id: "bench".into(),
                kind: Some(SosType::Medical),
                ..SosReport::default()
            })
            .await
            .expect("report");
        cases.push(case.id);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for id in cases {
        let p = p.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let assigned = p.dispatch.dispatch(id).await;
            if let Ok(case) = &assigned {
                p.dispatch.resolve(case.id).await.expect("resolve");
            }
            (assigned.is_ok(), t.elapsed())
        }));
    }
    let mut latencies = Vec::new();
    let mut served = 0;
    for h in handles {
        let (ok, l) = h.await.expect("task");
        if ok {
            served += 1;
        }
        latencies.push(l);
    }
    println!(
        "  {n_cases} cases over {fleet} ambulances: {served} served in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("dispatch latency", &mut latencies);
}

async fn phase4_ticks_under_check_ins() {
    let p = Arc::new(platform(false));
    let s = slot(&p, 10_000).await;
    let mut codes = Vec::new();
    for i in 0..1000 {
        codes.push(p.ledger.create(booking(&s, i, 3)).await.expect("booking").booking_id);
    }

    let ticker = {
        let p = p.clone();
        tokio::spawn(async move {
            let mut latencies = Vec::new();
            for _ in 0..1000 {
                let t = Instant::now();
                p.zones.tick().await.expect("tick");
                latencies.push(t.elapsed());
            }
            latencies
        })
    };
    let start = Instant::now();
    let mut handles = Vec::new();
    for code in codes {
        let p = p.clone();
        handles.push(tokio::spawn(async move { p.ledger.check_in(&code).await.is_ok() }));
    }
    let mut checked = 0;
    for h in handles {
        if h.await.expect("task") {
            checked += 1;
        }
    }
    let mut latencies = ticker.await.expect("ticker");
    println!(
        "  {checked} check-ins alongside 1000 ticks in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("tick latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== darshan stress benchmark ===\n");

    println!("[phase 1] sequential durable bookings");
    phase1_sequential().await;

    println!("\n[phase 2] contended bookings on one slot");
    phase2_one_hot_slot().await;

    println!("\n[phase 3] auto-dispatch storm");
    phase3_dispatch_storm().await;

    println!("\n[phase 4] zone ticks under check-in load");
    phase4_ticks_under_check_ins().await;

    println!("\n=== benchmark complete ===");
}
