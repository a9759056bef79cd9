//! Result / Command Log Sink.
//!
//! Two append-only files under the log directory: `cmd_results_list.log.csv`
//! (one row per finished command) and `cur_cmd` (a rotating single-line
//! file naming the command currently in flight, written before dispatch
//! and useful for post-mortem inspection after a crash). Kept deliberately
//! separate from the free-form `tracing` debug log. Grounded on
//! `original_source/logger.py`'s `results`/`cmd` class methods.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::mca::McaBank;

const RESULTS_HEADER: &str = "System Uptime,Command Number,Command Line,Cores Ran,ACF,ACF Failing Cores,ACF Details,MCE,MCE Failing Cores,MCE Details";

/// Opens (creating if absent) the CSV results file and the rotating
/// current-command file under `log_dir`.
pub struct ResultLog {
    results_file: File,
    cur_cmd_path: PathBuf,
}

impl ResultLog {
    pub fn open(log_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let results_path = Path::new(log_dir).join("cmd_results_list.log.csv");
        let is_new = !results_path.is_file();
        let mut results_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&results_path)?;
        if is_new {
            writeln!(results_file, "{RESULTS_HEADER}")?;
        }

        Ok(ResultLog {
            results_file,
            cur_cmd_path: Path::new(log_dir).join("cur_cmd"),
        })
    }

    /// Overwrite `cur_cmd` with the command about to be dispatched. Called
    /// immediately before execution so a crash mid-run still leaves a
    /// record of what was in flight.
    pub fn record_current(&self, sequence: u64, command_line: &str, cores: &[u32], uptime: &str) -> Result<()> {
        let core_str = join_cores(cores);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.cur_cmd_path)?;
        writeln!(f, "{},{sequence},{command_line},{core_str}", csv_quote(uptime))?;
        Ok(())
    }

    /// Append one finished command's outcome as a CSV row.
    #[allow(clippy::too_many_arguments)]
    pub fn record_result(
        &mut self,
        sequence: u64,
        command_line: &str,
        cores: &[u32],
        is_acf: bool,
        acf_failing_cores: &[u32],
        acf_details: &str,
        mce_banks: &[McaBank],
        uptime: &str,
    ) -> Result<()> {
        let core_str = join_cores(cores);
        let failing_str = acf_failing_cores
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let is_mce = !mce_banks.is_empty();
        let mut mce_failing_cores: Vec<u32> = mce_banks.iter().map(|b| b.core_id as u32).collect();
        mce_failing_cores.sort_unstable();
        mce_failing_cores.dedup();
        let mce_failing_str = mce_failing_cores
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mce_details = mce_banks
            .iter()
            .map(McaBank::describe)
            .collect::<Vec<_>>()
            .join(";;");

        writeln!(
            self.results_file,
            "{},{},{},{},{},{},{},{},{},{}",
            csv_quote(uptime),
            sequence,
            csv_quote(command_line),
            csv_quote(&core_str),
            is_acf,
            csv_quote(&failing_str),
            csv_quote(acf_details),
            is_mce,
            csv_quote(&mce_failing_str),
            csv_quote(&mce_details),
        )?;
        Ok(())
    }
}

fn join_cores(cores: &[u32]) -> String {
    cores.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Quotes a CSV field and escapes embedded quotes, mirroring the
/// original's hand-rolled `'"{}"'.format(...)` quoting.
fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Initializes the free-form `tracing` debug log sink at
/// `<log_dir>/debug.log`, non-blocking per the teacher's logging setup.
/// Returns the worker guard — it must be kept alive for the duration of
/// the process or buffered lines are dropped on exit.
pub fn init_tracing(log_dir: &str, filter_directive: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, "debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_directive))
        .with_ansi(false)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_log_file_gets_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        {
            let _log = ResultLog::open(log_dir).unwrap();
        }
        {
            let _log = ResultLog::open(log_dir).unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join("cmd_results_list.log.csv")).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with("System Uptime")).count(), 1);
    }

    #[test]
    fn record_result_appends_csv_row() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        let mut log = ResultLog::open(log_dir).unwrap();
        log.record_result(1, "binary -a 1", &[0, 1], false, &[], "", &[], "123.45")
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("cmd_results_list.log.csv")).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains("\"binary -a 1\""));
        assert!(rows[1].contains("false"));
    }

    #[test]
    fn mce_failing_cores_are_derived_from_bank_core_ids_not_acf() {
        use crate::mca::{McaDestat, McaStatus};
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        let mut log = ResultLog::open(log_dir).unwrap();
        let bank = McaBank {
            core_id: 7,
            bank_id: 0,
            socket_id: 0,
            status: McaStatus(0x8000_0000_0000_0000),
            addr: None,
            synd: None,
            ipid: 0,
            misc0: None,
            destat: McaDestat(0),
            deaddr: None,
        };
        // ACF reported core 2, MCA reported core 7 — distinct sets.
        log.record_result(1, "binary -a 1", &[2, 7], true, &[2], "acf on core 2", &[bank], "1.0")
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("cmd_results_list.log.csv")).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        let fields: Vec<&str> = rows[1].split(',').collect();
        // Columns: Uptime,CmdNum,CmdLine,Cores,ACF,ACFCores,ACFDetails,MCE,MCECores,MCEDetails
        assert_eq!(fields[5], "\"2\"");
        assert_eq!(fields[8], "\"7\"");
    }

    #[test]
    fn record_current_overwrites_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        let log = ResultLog::open(log_dir).unwrap();
        log.record_current(1, "cmd one", &[0], "1.0").unwrap();
        log.record_current(2, "cmd two", &[1], "2.0").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("cur_cmd")).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("cmd two"));
    }

    #[test]
    fn quoted_fields_escape_embedded_quotes() {
        assert_eq!(csv_quote("he said \"hi\""), "\"he said \"\"hi\"\"\"");
    }
}
