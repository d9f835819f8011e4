//! Tab-separated results file with fixed columns.

use anyhow::{ensure, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Append one row to a TSV results file, writing the header first when the
/// file does not exist yet.
pub fn write_tsv(heads: &[&str], values: &[String], path: impl AsRef<Path>) -> Result<()> {
    ensure!(
        heads.len() == values.len(),
        "got {} values for {} columns",
        values.len(),
        heads.len()
    );

    let path = path.as_ref();
    let write_header = !path.exists();

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if write_header {
        writeln!(file, "{}", heads.join("\t"))?;
    }
    writeln!(file, "{}", values.join("\t"))?;
    Ok(())
}
