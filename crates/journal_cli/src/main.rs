//! CLI probe for the journal core.
//!
//! Usage: `journal_cli [--config CONFIG_JSON] [DB_PATH]`
//! - Without arguments prints core linkage info.
//! - `--config` loads a `CoreConfig` JSON file and starts file logging.
//! - With a database path also prints offline queue stats for that file.

use journal_core::db::open_db;
use journal_core::{init_logging, CoreConfig, LocalQueue, SqliteKeyValueStore};
use std::path::Path;
use std::process::ExitCode;

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config_path: Option<String>,
    db_path: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().ok_or("--config requires a path")?;
            parsed.config_path = Some(path);
        } else if arg.starts_with("--") {
            return Err(format!("unknown option `{arg}`"));
        } else if parsed.db_path.is_none() {
            parsed.db_path = Some(arg);
        } else {
            return Err(format!("unexpected argument `{arg}`"));
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&str>) -> Result<CoreConfig, String> {
    let Some(path) = path else {
        return Ok(CoreConfig::default());
    };
    let raw = std::fs::read_to_string(Path::new(path))
        .map_err(|err| format!("failed to read config `{path}`: {err}"))?;
    CoreConfig::from_json_str(&raw).map_err(|err| format!("config `{path}`: {err}"))
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: journal_cli [--config CONFIG_JSON] [DB_PATH]");
            return ExitCode::FAILURE;
        }
    };

    println!("journal_core ping={}", journal_core::ping());
    println!("journal_core version={}", journal_core::core_version());

    let config = match load_config(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if args.config_path.is_some() {
        if let Err(err) = init_logging(&config.logging) {
            eprintln!("failed to start logging: {err}");
            return ExitCode::FAILURE;
        }
        println!("logging level={} dir={}", config.logging.level, config.logging.log_dir);
    }

    let Some(db_path) = args.db_path else {
        return ExitCode::SUCCESS;
    };

    let conn = match open_db(&db_path) {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("failed to open `{db_path}`: {err}");
            return ExitCode::FAILURE;
        }
    };

    let queue = LocalQueue::new(SqliteKeyValueStore::new(conn), config.sync.max_retries);
    let stats = queue.stats();
    println!(
        "queue total={} pending={} syncing={} synced={} failed={} oldest_pending_at_ms={}",
        stats.total,
        stats.pending,
        stats.syncing,
        stats.synced,
        stats.failed,
        stats
            .oldest_pending_at_ms
            .map_or_else(|| "-".to_string(), |t| t.to_string())
    );
    let meta = queue.meta();
    println!(
        "last_sync completed_at_ms={} synced={} failed={}",
        meta.last_sync_completed_at_ms
            .map_or_else(|| "-".to_string(), |t| t.to_string()),
        meta.last_synced_count,
        meta.last_failed_count
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::{load_config, parse_args, CliArgs};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_args_accepts_config_and_db_path() {
        let parsed = parse_args(args(&["--config", "/etc/journal.json", "queue.db"])).unwrap();
        assert_eq!(
            parsed,
            CliArgs {
                config_path: Some("/etc/journal.json".to_string()),
                db_path: Some("queue.db".to_string()),
            }
        );
        assert_eq!(parse_args(args(&[])).unwrap(), CliArgs::default());
    }

    #[test]
    fn parse_args_rejects_bad_input() {
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
        assert!(parse_args(args(&["a.db", "b.db"])).is_err());
    }

    #[test]
    fn load_config_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sync": {"max_retries": 5}}"#).unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.edit.min_changed_words, 3);
    }

    #[test]
    fn load_config_reports_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sync": {"max_retries": 0}}"#).unwrap();

        let err = load_config(path.to_str()).unwrap_err();
        assert!(err.contains("max_retries"), "{err}");
        assert!(load_config(Some("/nonexistent/journal.json")).is_err());
        assert_eq!(load_config(None).unwrap().sync.max_retries, 3);
    }
}
