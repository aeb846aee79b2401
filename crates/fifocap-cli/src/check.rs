/// Offline replay of a dump file through the integrity checker.

use std::fs::File;

use anyhow::{Context, Result};
use tracing::info;

use fifocap_engine::{IntegrityReport, RecordFormat, check_dump};

use crate::capture::log_integrity;
use crate::config::CheckArgs;

pub fn run(args: &CheckArgs) -> Result<IntegrityReport> {
    let file = File::open(&args.file)
        .with_context(|| format!("Can't open dump file {}", args.file.display()))?;
    let format = RecordFormat::from(args.format);
    info!("Checking {} as {:?}", args.file.display(), args.format);

    let report = check_dump(file, format)
        .with_context(|| format!("Can't read dump file {}", args.file.display()))?;
    log_integrity(&report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::FormatArg;

    #[test]
    fn test_check_reports_gaps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for counter in [0u32, 0x4000, 0x8000, 0x14000] {
            file.write_all(&counter.to_le_bytes()).unwrap();
            file.write_all(&[0; 12]).unwrap();
        }
        file.flush().unwrap();

        let args = CheckArgs {
            format: FormatArg::Binary,
            file: file.path().to_path_buf(),
        };
        let report = run(&args).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.missed_blocks, 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = CheckArgs {
            format: FormatArg::Text,
            file: dir.path().join("absent.txt"),
        };
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("Can't open dump file"));
    }
}
