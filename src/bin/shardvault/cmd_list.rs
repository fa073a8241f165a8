use anyhow::Result;
use std::path::PathBuf;

use shardvault::admin::list_backups;
use shardvault::blob::FsBlobStore;

pub fn exec(location: PathBuf, json: bool) -> Result<()> {
    let blob = FsBlobStore::open(&location)?;
    let list = list_backups(&blob)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No backups at {}", location.display());
        return Ok(());
    }
    println!("Backups at {}:", location.display());
    for b in &list {
        println!(
            "  {} #{:<3} {:<11} since={} read_ts={} encrypted={} path={}",
            b.backup_id, b.backup_num, b.backup_type, b.since, b.read_ts, b.encrypted, b.path
        );
        for g in &b.groups {
            println!("      group {:>3}: {} predicates", g.group_id, g.predicates.len());
        }
    }
    Ok(())
}
