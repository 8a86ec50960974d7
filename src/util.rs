use anyhow::{Result, bail};

/// Parses a human byte-size string such as `"100m"`, `"1.5g"`, or `"512kb"`.
///
/// Grammar: a decimal number, an optional `k`/`m`/`g` magnitude, and an
/// optional trailing `b`, all case-insensitive. Negative values are rejected.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let mut s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        bail!("empty size");
    }
    if s.ends_with('b') {
        s.truncate(s.len() - 1);
        s.truncate(s.trim_end().len());
        if s.is_empty() {
            bail!("invalid size '{input}'");
        }
    }
    let mult: u64 = match s.as_bytes()[s.len() - 1] {
        b'k' => 1024,
        b'm' => 1024 * 1024,
        b'g' => 1024 * 1024 * 1024,
        _ => 1,
    };
    if mult > 1 {
        s.truncate(s.len() - 1);
    }
    let s = s.trim();
    let value: f64 = s
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid size '{input}'"))?;
    if value < 0.0 {
        bail!("negative size '{input}'");
    }
    Ok((value * mult as f64) as u64)
}

/// Formats a byte count the way the stats log expects: `512b`, `1.5kb`,
/// `100mb`, `2gb`. Trailing `.0` is trimmed.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes < KB {
        return format!("{bytes}b");
    }
    let (scaled, unit) = if bytes < MB {
        (bytes as f64 / KB as f64, "kb")
    } else if bytes < GB {
        (bytes as f64 / MB as f64, "mb")
    } else {
        (bytes as f64 / GB as f64, "gb")
    };
    let mut s = format!("{scaled:.1}");
    if let Some(trimmed) = s.strip_suffix(".0") {
        s = trimmed.to_string();
    }
    format!("{s}{unit}")
}
