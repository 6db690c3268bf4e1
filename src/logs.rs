use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Returns the last `lines` lines of the daemon's log file.
///
/// # Arguments
/// * `log_path` - The file the daemon's sinks write to.
/// * `lines` - The number of log lines to return.
pub fn tail_lines(log_path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(log_path).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("log file {} unavailable: {err}", log_path.display()),
        )
    })?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);
    Ok(all_lines[start..].to_vec())
}

/// Writes the last `lines` lines of the log file to `out`.
pub fn show_logs(log_path: &Path, lines: usize, out: &mut impl Write) -> io::Result<()> {
    for line in tail_lines(log_path, lines)? {
        writeln!(out, "{}", line)?;
    }
    Ok(())
}
