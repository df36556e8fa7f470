use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const SLOTS_PER_DAY: usize = 10;

struct Target {
    host: String,
    port: u16,
    password: String,
}

async fn connect(target: &Target, campus: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(campus)
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// The i-th non-overlapping one hour slot, `SLOTS_PER_DAY` per day from 08:00.
fn slot(i: usize) -> (String, String, String) {
    let base = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let date = base + Days::new((i / SLOTS_PER_DAY) as u64);
    let hour = 8 + i % SLOTS_PER_DAY;
    (
        date.format("%Y-%m-%d").to_string(),
        format!("{hour:02}:00"),
        format!("{:02}:00", hour + 1),
    )
}

fn booking_sql(room: Ulid, (date, start, end): &(String, String, String)) -> String {
    format!(
        "INSERT INTO bookings (id, room_id, booking_date, start_time, end_time, purpose) \
         VALUES ('{}', '{room}', '{date}', '{start}', '{end}', 'bench')",
        Ulid::new()
    )
}

async fn create_room(admin: &Client) -> Ulid {
    let rid = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO rooms (id, room_name, capacity, room_type) VALUES ('{rid}', 'Bench {rid}', 40, 'classroom')"
        ))
        .await
        .unwrap();
    rid
}

async fn create_users(admin: &Client, n: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(n);
    for i in 0..n {
        let name = format!("bench{i}");
        admin
            .batch_execute(&format!(
                "INSERT INTO users (id, username, role, email) VALUES ('{}', '{name}', 'faculty', '{name}@campus.com')",
                Ulid::new()
            ))
            .await
            .unwrap();
        names.push(name);
    }
    names
}

async fn phase1_sequential(target: &Target) {
    let campus = format!("bench_{}", Ulid::new());
    let client = connect(target, &campus, "admin").await;
    let rid = create_room(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let sql = booking_sql(rid, &slot(i));
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many users race for the same slots of one room. Exactly one booking per
/// slot may win; everything else must come back as an exclusion violation.
async fn phase2_same_slot(target: &Target) {
    let n_users = 16;
    let n_slots = 100;

    let campus = format!("bench_{}", Ulid::new());
    let admin = connect(target, &campus, "admin").await;
    let rid = create_room(&admin).await;
    let users = create_users(&admin, n_users).await;
    drop(admin);

    let confirmed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for user in users {
        let client = connect(target, &campus, &user).await;
        let confirmed = confirmed.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_slots);
            for i in 0..n_slots {
                let sql = booking_sql(rid, &slot(i));
                let t = Instant::now();
                match client.batch_execute(&sql).await {
                    Ok(()) => {
                        confirmed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let ok = confirmed.load(Ordering::Relaxed);
    let rejected = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_users} users x {n_slots} slots: {ok} confirmed, {rejected} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(ok, n_slots, "each slot must be won exactly once");
    print_latency("contended booking latency", &mut all_latencies);
}

async fn phase3_parallel_rooms(target: &Target) {
    let n_tasks = 10;
    let n_per_task = 200;

    let campus = format!("bench_{}", Ulid::new());
    let admin = connect(target, &campus, "admin").await;
    let mut rooms = Vec::with_capacity(n_tasks);
    for _ in 0..n_tasks {
        rooms.push(create_room(&admin).await);
    }
    drop(admin);

    let start = Instant::now();
    let mut handles = Vec::new();

    for rid in rooms {
        let client = connect(target, &campus, "admin").await;
        handles.push(tokio::spawn(async move {
            for i in 0..n_per_task {
                client.batch_execute(&booking_sql(rid, &slot(i))).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} rooms x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_listing_under_load(target: &Target) {
    let campus = format!("bench_{}", Ulid::new());
    let admin = connect(target, &campus, "admin").await;
    let rid = create_room(&admin).await;
    for i in 0..200 {
        admin.batch_execute(&booking_sql(rid, &slot(i))).await.unwrap();
    }
    drop(admin);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let client = connect(target, &campus, "admin").await;
        let wrid = create_room(&client).await;
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&booking_sql(wrid, &slot(i))).await;
                i += 1;
            }
        })
    };

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut handles = Vec::new();
    for _ in 0..n_readers {
        let client = connect(target, &campus, "admin").await;
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM bookings WHERE room_id = '{rid}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    let _ = writer.await;

    print_latency("room schedule query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("CAMPUSD_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("CAMPUSD_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid CAMPUSD_PORT"),
        password: std::env::var("CAMPUSD_PASSWORD").unwrap_or_else(|_| "campusd".into()),
    };

    println!("=== campusd contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase books into its own fresh campus.

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] same-slot contention");
    phase2_same_slot(&target).await;

    println!("\n[phase 3] parallel rooms");
    phase3_parallel_rooms(&target).await;

    println!("\n[phase 4] schedule reads under write load");
    phase4_listing_under_load(&target).await;

    println!("\n=== benchmark complete ===");
}
