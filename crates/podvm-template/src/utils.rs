use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Validate that a work directory exists (creating it if needed) and is a directory
pub(crate) fn ensure_workdir(path: &Utf8Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create work directory: {path}"))?;
    }

    if !path.is_dir() {
        return Err(eyre!("Work directory is not a directory: {path}"));
    }

    Ok(())
}

/// Parse a duration string (e.g., "5s", "500ms", "2m", "1h", "10") to a Duration.
/// A bare number is seconds.
pub(crate) fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    if duration_str.is_empty() {
        return Err(eyre!("Empty duration string"));
    }

    let (number_part, unit_part) =
        if let Some(pos) = duration_str.rfind(|c: char| c.is_ascii_digit()) {
            duration_str.split_at(pos + 1)
        } else {
            return Err(eyre!("Invalid duration format: {}", duration_str));
        };

    let number: u64 = number_part
        .parse()
        .map_err(|_| eyre!("Invalid number in duration: {}", number_part))?;

    let d = match unit_part {
        "ms" => Duration::from_millis(number),
        "" | "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 3600),
        _ => return Err(eyre!("Unknown duration unit: {}", unit_part)),
    };

    Ok(d)
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u64> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory specification cannot be empty - please provide a value like '2G', '1024M', or '512'"));
    }

    let (number_part, scale) = match memory_str.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('G') => (&memory_str[..memory_str.len() - 1], 1024.0),
        Some('M') => (&memory_str[..memory_str.len() - 1], 1.0),
        // No suffix, assume megabytes
        _ => (memory_str, 1.0),
    };
    let n: f64 = number_part
        .parse()
        .context("Invalid number in memory specification")?;
    if n <= 0.0 {
        return Err(eyre!("Memory must be positive: {memory_str}"));
    }
    Ok((n * scale) as u64)
}
