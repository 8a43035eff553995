//! Post-processing of the log file written by a run
use crate::launcher::HEADER_LINES;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Replaces the middle of a log file that exceeded its size limit
pub const TRUNCATION_PLACEHOLDER: &str =
    "\n\n\nWARNING: YOUR LOGFILE WAS TOO LONG, SOME LINES IN THE MIDDLE WERE REMOVED.\n\n\n\n";

/// Line after which a crashed JVM names the file it dumped its error report to
pub const CRASH_REPORT_MARKER: &str = "# An error report file with more information is saved as:";

/// Shorten `content` to about `max_size` bytes by keeping whole lines from
/// the start and the end, each side filling at most half of `max_size`, and
/// replacing the rest with [`TRUNCATION_PLACEHOLDER`]. The first `keep_front`
/// lines are always kept. Returns `None` if nothing needs to be removed.
pub fn truncate_middle(content: &[u8], max_size: u64, keep_front: usize) -> Option<Vec<u8>> {
    if content.len() as u64 <= max_size {
        return None;
    }
    let lines: Vec<&[u8]> = content.split_inclusive(|&b| b == b'\n').collect();
    let half = max_size / 2;

    let mut front = keep_front.min(lines.len());
    let mut back = lines.len();
    let (mut front_size, mut back_size) = (0u64, 0u64);
    while front < back {
        let next = lines[front].len() as u64;
        if front_size + next > half {
            break;
        }
        front_size += next;
        front += 1;

        if front == back {
            break;
        }
        let next = lines[back - 1].len() as u64;
        if back_size + next > half {
            break;
        }
        back_size += next;
        back -= 1;
    }
    if front >= back {
        return None;
    }

    let mut reduced = Vec::with_capacity((front_size + back_size) as usize + TRUNCATION_PLACEHOLDER.len());
    lines[..front].iter().for_each(|line| reduced.extend_from_slice(line));
    reduced.extend_from_slice(TRUNCATION_PLACEHOLDER.as_bytes());
    lines[back..].iter().for_each(|line| reduced.extend_from_slice(line));
    Some(reduced)
}

/// Truncate the log file at `path` if it is larger than `max_size` bytes.
/// Returns whether the file was changed.
pub fn reduce_file_size_if_necessary(path: &Path, max_size: u64) -> io::Result<bool> {
    if fs::metadata(path)?.len() <= max_size {
        return Ok(false);
    }
    let content = fs::read(path)?;
    match truncate_middle(&content, max_size, HEADER_LINES) {
        Some(reduced) => {
            log::debug!(
                "Truncating log file {} from {} to {} bytes",
                path.display(),
                content.len(),
                reduced.len()
            );
            fs::write(path, reduced)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Output lines of the tool, without the log header
pub fn read_output(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read(path)?;
    Ok(String::from_utf8_lossy(&content)
        .lines()
        .skip(HEADER_LINES)
        .map(str::to_string)
        .collect())
}

/// Name of the crash report announced in `lines`, if any
pub fn find_crash_report(lines: &[String]) -> Option<PathBuf> {
    lines
        .windows(2)
        .find(|pair| pair[0].trim() == CRASH_REPORT_MARKER)
        .and_then(|pair| pair[1].trim().strip_prefix('#'))
        .map(|name| PathBuf::from(name.trim()))
        .filter(|name| !name.as_os_str().is_empty())
}

/// Move the contents of an announced crash report into the log file and
/// `lines`, then delete the report.
pub fn append_crash_report(log_path: &Path, working_dir: Option<&Path>, lines: &mut Vec<String>) -> io::Result<()> {
    let Some(name) = find_crash_report(lines) else {
        return Ok(());
    };
    let report = match working_dir {
        Some(dir) if name.is_relative() => dir.join(name),
        _ => name,
    };
    if !report.is_file() {
        log::debug!("Announced crash report {} does not exist", report.display());
        return Ok(());
    }

    let content = fs::read(&report)?;
    let mut log = OpenOptions::new().append(true).open(log_path)?;
    log.write_all(b"\n")?;
    log.write_all(&content)?;
    lines.push(String::new());
    lines.extend(String::from_utf8_lossy(&content).lines().map(str::to_string));
    fs::remove_file(&report)?;
    log::info!("Appended crash report {} to {}", report.display(), log_path.display());
    Ok(())
}
