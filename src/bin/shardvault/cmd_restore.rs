use anyhow::Result;
use std::path::PathBuf;

use shardvault::admin::{RestoreResponse, CODE_SUCCESS};
use shardvault::blob::FsBlobStore;
use shardvault::config::BackupConfig;
use shardvault::metrics;
use shardvault::restore::{run_offline_restore, RestoreOptions};

use super::util::{load_key, target_from_args};

pub struct Args {
    pub location: PathBuf,
    pub dest: PathBuf,
    pub backup_id: Option<String>,
    pub backup_num: Option<i64>,
    pub commit_ts: Option<u64>,
    pub encryption_key_file: Option<PathBuf>,
    pub incremental_from: Option<u64>,
    pub json: bool,
}

pub fn exec(args: Args) -> Result<()> {
    let cfg = BackupConfig::from_env();
    let blob = FsBlobStore::open(&args.location)?;
    let target = target_from_args(args.backup_id, args.backup_num, args.commit_ts)?;

    let mut opts = RestoreOptions::default();
    if let Some(k) = load_key(args.encryption_key_file.or(cfg.encryption_key_file.clone()))? {
        opts = opts.with_key(k);
    }
    if let Some(n) = args.incremental_from {
        opts = opts.with_incremental_from(n);
    }

    let res = run_offline_restore(&blob, &args.dest, &target, &opts, &cfg);
    let resp = RestoreResponse::from_result(&res);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else if let Ok(s) = &res {
        println!("Restore into {}:", args.dest.display());
        println!("  backup_id  = {}", s.backup_id);
        println!("  backup_num = {}", s.backup_num);
        println!("  read_ts    = {}", s.read_ts);
        println!("  max_ts     = {}", s.max_ts);
        for g in &s.groups {
            println!(
                "  group {:>3}: max_ts={} records={} predicates={:?}",
                g.group_id, g.max_ts, g.records_applied, g.predicates
            );
        }
        let m = metrics::snapshot();
        println!(
            "  metrics: records_applied={} drop_ops={} pruned={}",
            m.restore_records_applied, m.drop_ops_applied, m.predicates_pruned
        );
    }

    if resp.code != CODE_SUCCESS {
        // keep the typed error (and its context) for the exit message
        res?;
    }
    Ok(())
}
