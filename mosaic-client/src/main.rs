//! mosaic-watch: follows both listing partitions and prints every published
//! snapshot.
//!
//! Usage: `mosaic-watch --config <path> [--search <text>]`

use mosaic_client::{telemetry, ClientConfig, ClientError};
use mosaic_core::{FuzzyIndex, LocalSearch, Partition, SearchOptions};
use mosaic_sync::ListSnapshot;
use tracing::warn;

const MAX_HITS: usize = 5;

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ClientConfig::load()?;
    telemetry::init_tracing(&config.logging)?;
    let search = arg_value("--search");

    let session = mosaic_client::connect(&config)?;
    let engine = session.engine.clone();
    for partition in Partition::ALL {
        if let Err(err) = engine.open(partition).await {
            warn!(partition = %partition, error = %err, "Initial load failed");
        }
    }

    let options = SearchOptions::default();
    let mut indexes: [Option<FuzzyIndex>; 2] = [None, None];
    let mut active = engine.subscribe(Partition::Active);
    let mut trashed = engine.subscribe(Partition::Trashed);
    let mut channel = session.invalidator.subscribe();

    for rx in [&mut active, &mut trashed] {
        let snapshot = rx.borrow_and_update().clone();
        print_snapshot(&snapshot, search.as_deref(), &mut indexes, &options);
    }

    loop {
        tokio::select! {
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = active.borrow_and_update().clone();
                print_snapshot(&snapshot, search.as_deref(), &mut indexes, &options);
            }
            changed = trashed.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = trashed.borrow_and_update().clone();
                print_snapshot(&snapshot, search.as_deref(), &mut indexes, &options);
            }
            changed = channel.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *channel.borrow_and_update();
                println!("push channel: {:?}", state);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown();
    Ok(())
}

fn print_snapshot(
    snapshot: &ListSnapshot,
    search: Option<&str>,
    indexes: &mut [Option<FuzzyIndex>; 2],
    options: &SearchOptions,
) {
    let loading = if snapshot.is_loading { " loading" } else { "" };
    println!(
        "{} page {}/{}: {} of {} items ({:?}{})",
        snapshot.partition,
        snapshot.page,
        snapshot.total_pages,
        snapshot.len(),
        snapshot.total_items,
        snapshot.freshness,
        loading,
    );
    if let Some(err) = &snapshot.error {
        println!("  error: {}", err);
    }

    let Some(query) = search else { return };
    let slot = &mut indexes[snapshot.partition.index()];
    *slot = snapshot.local_index(slot.take(), options);
    match slot {
        Some(index) => {
            for hit in index.search(query).into_iter().take(MAX_HITS) {
                if let Some(item) = index.items().get(hit.index) {
                    println!("  {:.2} {} {}", hit.score, item.id, item.title);
                }
            }
        }
        None => println!(
            "  search waits for the full list ({} of {} loaded)",
            snapshot.len(),
            snapshot.total_items
        ),
    }
}

fn arg_value(flag: &str) -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}
