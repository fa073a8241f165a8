use anyhow::Result;
use env_logger::{Builder, Env};

mod cli;
mod util;
mod cmd_restore;
mod cmd_list;
mod cmd_verify;
mod cmd_inspect;

fn init_logger() {
    // RUST_LOG overrides; default is info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse_args();
    match cli.cmd {
        cli::Cmd::Restore {
            location,
            dest,
            backup_id,
            backup_num,
            commit_ts,
            encryption_key_file,
            incremental_from,
            json,
        } => cmd_restore::exec(cmd_restore::Args {
            location,
            dest,
            backup_id,
            backup_num,
            commit_ts,
            encryption_key_file,
            incremental_from,
            json,
        }),

        cli::Cmd::ListBackups { location, json } => cmd_list::exec(location, json),

        cli::Cmd::Verify {
            location,
            backup_id,
            backup_num,
            encryption_key_file,
        } => cmd_verify::exec(location, backup_id, backup_num, encryption_key_file),

        cli::Cmd::Inspect { path } => cmd_inspect::exec(path),
    }
}
