use std::path::PathBuf;
use std::time::Duration;

use acal_cache::alarm::AlarmRow;
use acal_cache::cache::CacheRow;
use acal_cache::config::{ALARM_META_FILE, ALARM_TABLE_FILE, CACHE_META_FILE, CACHE_TABLE_FILE};
use acal_cache::meta::MetaStore;
use acal_cache::table::Table;
use acal_cache::utils::{print_alarm_queue, print_cache_rows, print_meta};
use acal_cache::Settings;

fn main() {
    env_logger::init();

    let data_dir = match std::env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("Usage: inspect <data directory>");
            std::process::exit(1);
        },
    };
    let settings = Settings::in_dir(&data_dir);
    let lock_timeout = Duration::from_secs(5);

    for &(name, file) in [("Cache", CACHE_META_FILE), ("Alarms", ALARM_META_FILE)].iter() {
        let meta = MetaStore::new(name, settings.data_file(file), lock_timeout);
        match meta.load() {
            Ok(state) => print_meta(name, state.as_ref()),
            Err(err) => log::error!("Unable to read the {} meta row: {}", name, err),
        }
    }

    let cache: Table<CacheRow> = Table::load_or_new("cache", settings.data_file(CACHE_TABLE_FILE));
    let mut rows = cache.select(|_| true);
    rows.sort_by_key(|row| row.start());
    println!("{} cached occurrences", rows.len());
    print_cache_rows(&rows);

    let alarms: Table<AlarmRow> = Table::load_or_new("alarms", settings.data_file(ALARM_TABLE_FILE));
    let mut queue = alarms.select(|_| true);
    queue.sort_by_key(|alarm| alarm.time_to_fire());
    println!("{} alarms", queue.len());
    print_alarm_queue(&queue);
}
